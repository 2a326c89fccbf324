use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use docq_client::RemoteCollection;
use docq_core::store::SortKey;
use docq_core::{
    DocqConfig, EnqueueTime, Message, MessageId, Payload, Query, Queue, RocksDbStore, Schedule,
};
use serde_json::Value;
use tracing::debug;

#[derive(Parser)]
#[command(name = "docq", about = "Priority queue over a document collection")]
struct Cli {
    /// Config file (default: docq.toml, then /etc/docq/docq.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Collection holding the queue (overrides the config file)
    #[arg(long, global = true)]
    collection: Option<String>,

    /// docq-server base URL (overrides the config file)
    #[arg(long, global = true)]
    addr: Option<String>,

    /// Open the data directory directly instead of going through a server.
    /// Fails while a server or another local command holds the store.
    #[arg(long, global = true, conflicts_with = "addr")]
    local: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a message
    Send {
        /// Payload as a JSON object
        payload: String,

        #[command(flatten)]
        schedule: ScheduleArgs,
    },

    /// Claim the next message and print it as JSON
    Get {
        /// Filter on payload fields, as a JSON object
        #[arg(long)]
        query: Option<String>,

        /// Lease length in milliseconds
        #[arg(long)]
        lease_ms: Option<u64>,

        /// How long to wait for a message, in milliseconds
        #[arg(long)]
        wait_ms: Option<u64>,

        /// Pause between attempts, in milliseconds
        #[arg(long)]
        poll_ms: Option<u64>,
    },

    /// Acknowledge (delete) a message
    Ack {
        /// Message id
        id: MessageId,
    },

    /// Replace a claimed message's payload and hand it back to the queue
    AckSend {
        /// The message as printed by `get`
        message: String,

        /// New payload as a JSON object
        payload: String,

        #[command(flatten)]
        schedule: ScheduleArgs,
    },

    /// Hand a claimed message back to the queue with a new schedule
    Requeue {
        /// The message as printed by `get`
        message: String,

        #[command(flatten)]
        schedule: ScheduleArgs,
    },

    /// Count messages
    Count {
        /// Filter on payload fields, as a JSON object
        #[arg(long)]
        query: Option<String>,

        /// Only the message with this id
        #[arg(long)]
        id: Option<MessageId>,

        /// Only leased (true) or unleased (false) messages
        #[arg(long)]
        running: Option<bool>,
    },

    /// Create the index used by `get`
    EnsureGetIndex {
        /// Payload field sorted before priority, as field:1 or field:-1
        #[arg(long = "before")]
        before: Vec<SortKey>,

        /// Payload field sorted after enqueue time, as field:1 or field:-1
        #[arg(long = "after")]
        after: Vec<SortKey>,
    },

    /// Create an index used by `count`
    EnsureCountIndex {
        /// Payload field, as field:1 or field:-1
        #[arg(long = "field")]
        fields: Vec<SortKey>,

        /// Prefix the index with the running flag
        #[arg(long)]
        include_running: bool,
    },

    /// List the collection's indexes
    Indexes,
}

#[derive(Args)]
struct ScheduleArgs {
    /// Lower values are claimed first
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    priority: f64,

    /// Not claimable before this time (nanoseconds since the epoch)
    #[arg(long, conflicts_with = "delay_ms")]
    earliest_get: Option<u64>,

    /// Not claimable for this many milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Keep the stored enqueue time instead of moving to the back
    #[arg(long)]
    keep_enqueued_at: bool,
}

impl ScheduleArgs {
    fn schedule(&self) -> Schedule {
        let schedule = Schedule::new().priority(self.priority);
        match (self.earliest_get, self.delay_ms) {
            (Some(at), _) => schedule.earliest_get(at),
            (None, Some(ms)) => schedule.delay(Duration::from_millis(ms)),
            (None, None) => schedule,
        }
    }

    fn enqueue_time(&self) -> EnqueueTime {
        if self.keep_enqueued_at {
            EnqueueTime::Preserve
        } else {
            EnqueueTime::Refresh
        }
    }
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    process::exit(1);
}

fn open_queue(cli: &Cli, config: &DocqConfig) -> Queue {
    let name = &config.queue.collection;
    if cli.local {
        let store = RocksDbStore::open(&config.storage.data_dir).unwrap_or_else(|e| {
            fail(format!(
                "cannot open store at {}: {e}",
                config.storage.data_dir
            ))
        });
        let collection = store.collection(name).unwrap_or_else(|e| fail(e));
        return Queue::new(Arc::new(collection), name.clone());
    }

    let addr = cli.addr.as_deref().unwrap_or(&config.client.addr);
    debug!(addr, collection = %name, "using docq-server");
    let remote = RemoteCollection::new(addr, name.clone()).unwrap_or_else(|e| fail(e));
    Queue::new(Arc::new(remote), name.clone())
}

fn parse_json(what: &str, text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|e| fail(format!("invalid {what} JSON: {e}")))
}

fn parse_payload(text: &str) -> Payload {
    match parse_json("payload", text) {
        Value::Object(map) => map,
        _ => fail("payload must be a JSON object"),
    }
}

fn parse_message(text: &str) -> Message {
    serde_json::from_value(parse_json("message", text))
        .unwrap_or_else(|e| fail(format!("invalid message: {e}")))
}

fn parse_query(text: Option<&str>) -> Query {
    match text {
        Some(text) => Query::from_json(&parse_json("query", text)).unwrap_or_else(|e| fail(e)),
        None => Query::new(),
    }
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => fail(e),
    }
}

fn cmd_send(queue: &Queue, payload: &str, args: &ScheduleArgs) {
    match queue.send(parse_payload(payload), args.schedule()) {
        Ok(id) => println!("{id}"),
        Err(e) => fail(e),
    }
}

fn cmd_get(
    queue: &Queue,
    config: &DocqConfig,
    query: Option<&str>,
    lease_ms: Option<u64>,
    wait_ms: Option<u64>,
    poll_ms: Option<u64>,
) {
    let mut opts = config.get_options();
    if let Some(ms) = lease_ms {
        opts.lease = Duration::from_millis(ms);
    }
    if let Some(ms) = wait_ms {
        opts.wait = Duration::from_millis(ms);
    }
    if let Some(ms) = poll_ms {
        opts.poll = Duration::from_millis(ms);
    }

    match queue.get(&parse_query(query), &opts) {
        Ok(Some(message)) => print_json(&message),
        Ok(None) => {}
        Err(e) => fail(e),
    }
}

fn cmd_ack(queue: &Queue, id: MessageId) {
    match queue.ack_id(&id) {
        Ok(()) => println!("Acknowledged {id}"),
        Err(e) => fail(e),
    }
}

fn cmd_ack_send(queue: &Queue, message: &str, payload: &str, args: &ScheduleArgs) {
    let message = parse_message(message);
    match queue.ack_send(
        &message,
        parse_payload(payload),
        args.schedule(),
        args.enqueue_time(),
    ) {
        Ok(()) => println!("Sent back {}", message.id),
        Err(e) => fail(e),
    }
}

fn cmd_requeue(queue: &Queue, message: &str, args: &ScheduleArgs) {
    let message = parse_message(message);
    match queue.requeue(&message, args.schedule(), args.enqueue_time()) {
        Ok(()) => println!("Requeued {}", message.id),
        Err(e) => fail(e),
    }
}

fn count_query(query: Option<&str>, id: Option<MessageId>) -> Query {
    let query = parse_query(query);
    match id {
        Some(id) => query.with_id(id),
        None => query,
    }
}

fn cmd_count(
    queue: &Queue,
    query: Option<&str>,
    id: Option<MessageId>,
    running: Option<bool>,
) {
    match queue.count(&count_query(query, id), running) {
        Ok(n) => println!("{n}"),
        Err(e) => fail(e),
    }
}

fn cmd_indexes(queue: &Queue) {
    let indexes = queue
        .collection()
        .list_indexes()
        .unwrap_or_else(|e| fail(e));
    if indexes.is_empty() {
        println!("No indexes found.");
        return;
    }

    let name_width = indexes
        .iter()
        .map(|idx| idx.name.len())
        .max()
        .unwrap_or(4)
        .max(4);
    println!("{:<name_width$}  KEYS", "NAME");
    for idx in &indexes {
        let keys = idx
            .keys
            .iter()
            .map(|k| format!("{}:{}", k.path, k.direction))
            .collect::<Vec<_>>()
            .join(", ");
        println!("{:<name_width$}  {keys}", idx.name);
    }
}

fn main() {
    docq_core::telemetry::init_tracing();

    let cli = Cli::parse();
    let mut config = DocqConfig::discover(cli.config.as_deref()).unwrap_or_else(|e| fail(e));
    if let Some(collection) = &cli.collection {
        config.queue.collection = collection.clone();
    }
    let queue = open_queue(&cli, &config);

    match cli.command {
        Commands::Send { payload, schedule } => cmd_send(&queue, &payload, &schedule),
        Commands::Get {
            query,
            lease_ms,
            wait_ms,
            poll_ms,
        } => cmd_get(
            &queue,
            &config,
            query.as_deref(),
            lease_ms,
            wait_ms,
            poll_ms,
        ),
        Commands::Ack { id } => cmd_ack(&queue, id),
        Commands::AckSend {
            message,
            payload,
            schedule,
        } => cmd_ack_send(&queue, &message, &payload, &schedule),
        Commands::Requeue { message, schedule } => cmd_requeue(&queue, &message, &schedule),
        Commands::Count { query, id, running } => {
            cmd_count(&queue, query.as_deref(), id, running)
        }
        Commands::EnsureGetIndex { before, after } => {
            match queue.ensure_get_index(&before, &after) {
                Ok(name) => println!("Index \"{name}\" ready"),
                Err(e) => fail(e),
            }
        }
        Commands::EnsureCountIndex {
            fields,
            include_running,
        } => match queue.ensure_count_index(&fields, include_running) {
            Ok(name) => println!("Index \"{name}\" ready"),
            Err(e) => fail(e),
        },
        Commands::Indexes => cmd_indexes(&queue),
    }

    if let Err(e) = queue.collection().flush() {
        fail(e);
    }
}
