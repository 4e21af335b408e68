//! STRATA - LSM-Tree Key-Value Storage Engine
//! Interactive shell over an embedded engine.
//!
//! Usage: `strata [config.json]`. Without an argument the engine runs with
//! default settings in `./strata_data`.

use std::io::{self, BufRead, Write};

use strata::config::Config;
use strata::engine::Strata;
use strata::error::Result;

const PAGE_SIZE: usize = 20;

fn print_pairs(pairs: &[(Vec<u8>, Vec<u8>)]) {
    if pairs.is_empty() {
        println!("  (empty)");
        return;
    }
    for (key, value) in pairs {
        let k = String::from_utf8_lossy(key);
        let v = String::from_utf8_lossy(value);
        println!("  {} -> {}", k, v);
    }
    println!("  ({} entries)", pairs.len());
}

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::from_json_file(path),
        None => Ok(Config::default()),
    }
}

fn parse_page(arg: Option<&&str>) -> usize {
    arg.and_then(|p| p.parse().ok()).unwrap_or(1)
}

/// Execute one command. Returns false when the shell should exit.
fn execute(engine: &mut Strata, parts: &[&str]) -> Result<bool> {
    match parts[0].to_lowercase().as_str() {
        "set" | "put" => {
            if parts.len() < 3 {
                println!("  Usage: set <key> <value>");
                return Ok(true);
            }
            let key = parts[1].as_bytes().to_vec();
            let value = parts[2..].join(" ").into_bytes();
            engine.put(key, value)?;
            println!("  OK");
        }
        "get" => {
            if parts.len() < 2 {
                println!("  Usage: get <key>");
                return Ok(true);
            }
            match engine.get(parts[1].as_bytes())? {
                Some(value) => match String::from_utf8(value) {
                    Ok(s) => println!("  \"{}\"", s),
                    Err(_) => println!("  <binary data>"),
                },
                None => println!("  (nil)"),
            }
        }
        "del" | "delete" => {
            if parts.len() < 2 {
                println!("  Usage: del <key>");
                return Ok(true);
            }
            engine.delete(parts[1].as_bytes().to_vec())?;
            println!("  OK (deleted)");
        }
        "scan" | "list" => print_pairs(&engine.scan()?),
        "range" => {
            if parts.len() < 3 {
                println!("  Usage: range <start> <end> [page]");
                return Ok(true);
            }
            let page = parse_page(parts.get(3));
            print_pairs(&engine.range_scan(
                parts[1].as_bytes(),
                parts[2].as_bytes(),
                page,
                PAGE_SIZE,
            )?);
        }
        "prefix" => {
            if parts.len() < 2 {
                println!("  Usage: prefix <prefix> [page]");
                return Ok(true);
            }
            let page = parse_page(parts.get(2));
            print_pairs(&engine.prefix_scan(parts[1].as_bytes(), page, PAGE_SIZE)?);
        }
        "flush" => {
            engine.flush()?;
            println!("  OK (flushed)");
        }
        "compact" => {
            let merges = engine.compact()?;
            println!("  OK ({} merges)", merges);
        }
        "verify" => {
            let parsed = (
                parts.get(1).and_then(|l| l.parse::<u32>().ok()),
                parts.get(2).and_then(|g| g.parse::<u64>().ok()),
            );
            let (Some(level), Some(generation)) = parsed else {
                println!("  Usage: verify <level> <generation>");
                return Ok(true);
            };
            let damaged = engine.verify_table(level, generation)?;
            if damaged.is_empty() {
                println!("  OK (intact)");
            } else {
                println!("  DAMAGED blocks: {:?}", damaged);
            }
        }
        "info" | "stats" => {
            println!("  Entries:       {}", engine.len()?);
            println!("  MemTable size: {} bytes", engine.memtable_size());
            for (i, tables) in engine.levels().iter().enumerate() {
                println!("  Level {}:       {} table(s)", i + 1, tables.len());
            }
            println!("{}", engine.metrics().report());
        }
        "exit" | "quit" | "q" => {
            println!("  Shutting down STRATA...");
            return Ok(false);
        }
        _ => {
            println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
        }
    }
    Ok(true)
}

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║           STRATA Storage Engine           ║");
    println!("  ║      LSM-Tree Key-Value Store v0.1.0      ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    set <key> <value>         - Store a key-value pair");
    println!("    get <key>                 - Retrieve a value by key");
    println!("    del <key>                 - Delete a key");
    println!("    scan                      - List all key-value pairs");
    println!("    range <start> <end> [pg]  - Keys in [start, end), paginated");
    println!("    prefix <prefix> [pg]      - Keys with a prefix, paginated");
    println!("    flush                     - Persist memtables to level 1");
    println!("    compact                   - Run compaction until quiet");
    println!("    verify <level> <gen>      - Check a table's Merkle tree");
    println!("    info                      - Show engine statistics");
    println!("    exit                      - Shutdown engine");
    println!();

    let opened = load_config().and_then(Strata::open);
    let mut engine = match opened {
        Ok(e) => e,
        Err(err) => {
            eprintln!("[ERROR] Failed to open engine: {}", err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("strata> ");
        if let Err(e) = stdout.flush() {
            eprintln!("[ERROR] {}", e);
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("[ERROR] {}", e);
                break;
            }
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match execute(&mut engine, &parts) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("  ERROR: {}", e),
        }
    }
}
