use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use trailpack::encode;
use trailpack::event::{make_item, Event, EventGraph};

/// One input line: an actor id, an RFC 3339 timestamp, and the event's
/// field values. Field and value ids are interned in first-seen order so
/// that re-running the loader on the same input yields the same graph.
#[derive(Deserialize)]
struct RawEvent {
    cookie: String,
    timestamp: String,
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

fn parse_timestamp(ts: &str) -> Result<u32, Box<dyn Error>> {
    let dt = chrono::DateTime::parse_from_rfc3339(ts)?;
    Ok(dt.timestamp() as u32)
}

struct Lexicon {
    field_ids: HashMap<String, u8>,
    /// value -> id per field, indexed by field id - 1
    values: Vec<HashMap<String, u32>>,
}

impl Lexicon {
    fn new() -> Self {
        Self { field_ids: HashMap::new(), values: Vec::new() }
    }

    fn field(&mut self, name: &str) -> Result<u8, Box<dyn Error>> {
        if let Some(&id) = self.field_ids.get(name) {
            return Ok(id);
        }
        // field 0 is the timestamp, so named fields start at 1
        let id = self.values.len() + 1;
        if id > 255 {
            return Err("too many fields (the item format caps fields at 255)".into());
        }
        self.field_ids.insert(name.to_string(), id as u8);
        self.values.push(HashMap::new());
        Ok(id as u8)
    }

    fn value(&mut self, field: u8, value: &str) -> Result<u32, Box<dyn Error>> {
        let lexicon = &mut self.values[field as usize - 1];
        if let Some(&id) = lexicon.get(value) {
            return Ok(id);
        }
        // value 0 is reserved as "absent"
        let id = lexicon.len() as u32 + 1;
        if id >= 1 << 24 {
            return Err(format!("field {} has too many distinct values", field).into());
        }
        lexicon.insert(value.to_string(), id);
        Ok(id)
    }
}

fn load_graph(path: &str) -> Result<EventGraph, Box<dyn Error>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut lexicon = Lexicon::new();
    let mut events: Vec<Event> = Vec::new();
    let mut items: Vec<u64> = Vec::new();
    let mut cookie_ids: HashMap<String, usize> = HashMap::new();
    let mut cookie_pointers: Vec<u64> = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let raw: RawEvent = serde_json::from_str(&line)?;
        let timestamp = parse_timestamp(&raw.timestamp)?;

        let item_zero = items.len() as u64;
        for (name, value) in &raw.fields {
            let field = lexicon.field(name)?;
            let val = lexicon.value(field, value)?;
            items.push(make_item(field, val));
        }

        let (cookie, prev_event_idx) = match cookie_ids.get(raw.cookie.as_str()) {
            Some(&c) => (c, cookie_pointers[c] + 1),
            None => {
                let c = cookie_pointers.len();
                cookie_ids.insert(raw.cookie, c);
                cookie_pointers.push(0);
                (c, 0)
            }
        };

        events.push(Event {
            timestamp,
            item_zero,
            num_items: (items.len() as u64 - item_zero) as u32,
            prev_event_idx,
        });
        cookie_pointers[cookie] = events.len() as u64 - 1;
    }

    let num_fields = lexicon.values.len() as u32 + 1;
    let mut field_cardinalities = vec![0u64];
    field_cardinalities.extend(lexicon.values.iter().map(|v| v.len() as u64));

    Ok(EventGraph { events, items, cookie_pointers, num_fields, field_cardinalities })
}

fn format_bytes(bytes: u64) -> String {
    let s = bytes.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: trailpack <events.jsonl> <output-dir>");
        std::process::exit(2);
    }
    let input = &args[1];
    let root = Path::new(&args[2]);
    std::fs::create_dir_all(root)?;

    let graph = load_graph(input)?;
    let num_events = graph.events.len();
    let num_cookies = graph.cookie_pointers.len();
    if num_events == 0 {
        return Err("no events in input".into());
    }
    println!("Loaded {} events from {} actors", num_events, num_cookies);

    encode(graph, root)?;

    let trails = std::fs::metadata(root.join("trails.data"))?.len();
    let codebook = std::fs::metadata(root.join("trails.codebook"))?.len();
    println!(
        "Encoded into {} ({} bytes trails, {} bytes codebook)",
        root.display(),
        format_bytes(trails),
        format_bytes(codebook)
    );

    Ok(())
}
