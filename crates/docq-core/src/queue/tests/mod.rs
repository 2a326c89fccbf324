use super::*;
use crate::message::{Message, Payload};
use crate::query::Query;
use crate::store::{MemoryCollection, RocksDbStore, SortKey};
use serde_json::json;
use std::thread;

mod common;
use common::*;
