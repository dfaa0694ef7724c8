use anyhow::{bail, Context, Result};
use rfetch::{init_tracing_once, parse_timestamp, ApiConfig, Harvester, HarvestOptions, HttpListingApi, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_DB: &str = "./rfetch.db";
const USAGE: &str = "usage: rfetch <source> <start> <end> [--incremental] [--no-replies] [--batch-size N] [--db PATH]\n\
                     dates are YYYY-MM-DD or RFC 3339; the range is [start, end)";

struct Args {
    source: String,
    start: String,
    end: String,
    incremental: bool,
    include_replies: bool,
    batch_size: usize,
    db: PathBuf,
}

fn parse_args() -> Result<Args> {
    let mut positional = Vec::new();
    let mut args = Args {
        source: String::new(),
        start: String::new(),
        end: String::new(),
        incremental: false,
        include_replies: true,
        batch_size: 0,
        db: PathBuf::from(DEFAULT_DB),
    };
    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        match a.as_str() {
            "--incremental" => args.incremental = true,
            "--no-replies" => args.include_replies = false,
            "--batch-size" => {
                let v = it.next().context("--batch-size needs a value")?;
                args.batch_size = v.parse().with_context(|| format!("invalid --batch-size {v:?}"))?;
                if args.batch_size == 0 {
                    bail!("--batch-size must be at least 1");
                }
            }
            "--db" => args.db = PathBuf::from(it.next().context("--db needs a path")?),
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            flag if flag.starts_with("--") => bail!("unknown flag {flag}\n{USAGE}"),
            _ => positional.push(a),
        }
    }
    let [source, start, end]: [String; 3] = positional
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected <source> <start> <end>\n{USAGE}"))?;
    args.source = source;
    args.start = start;
    args.end = end;
    Ok(args)
}

fn main() -> Result<()> {
    init_tracing_once();
    let args = parse_args()?;
    let start = parse_timestamp(&args.start)?;
    let end = parse_timestamp(&args.end)?;

    let opts = HarvestOptions::from_env().context("read RFETCH_* settings")?;
    let store = Arc::new(SqliteStore::open(&args.db)?);
    let api = Arc::new(HttpListingApi::new(ApiConfig::from_env()));
    let telemetry = Harvester::default_telemetry(&opts);
    let harvester = Harvester::with_sqlite(opts, api, store, telemetry)?;

    let summary =
        harvester.fetch_source_data(&args.source, start, end, args.include_replies, args.batch_size, args.incremental);
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !summary.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}
