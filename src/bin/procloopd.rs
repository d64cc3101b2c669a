//! procloop demo daemon
//!
//! Small process trees that show the runtime at work: label routing,
//! message coalescing, tree shutdown and status output.

use anyhow::{anyhow, Context, Result};
use procloop::{Loop, LoopConfig, ResolutionMessage, Trigger};
use std::env;
use std::process;
use std::time::Duration;

const GROUP: &str = "group";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let config = LoopConfig::from_rc();
    procloop::logging::init(&config);

    let command = &args[1];
    let code = match command.as_str() {
        "ping" => run_ping(config)?,
        "coalesce" => run_coalesce(config)?,
        "shutdown" => run_shutdown(config)?,
        "tree" => run_tree(config)?,
        "-h" | "--help" => {
            print_usage();
            0
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(1);
        }
    };
    process::exit(code);
}

fn new_loop(config: LoopConfig) -> Result<Loop> {
    Loop::with_config(config, &["root"]).context("cannot start the root loop")
}

/// Root pings the "group" children every second; each answers its sender
fn run_ping(config: LoopConfig) -> Result<i32> {
    let mut lp = new_loop(config)?;

    for _ in 0..2 {
        lp.fork(&[GROUP], |child| {
            child.on(Trigger::MessageReceived, |lp, args| {
                for message in args.messages() {
                    println!(
                        "[{}] got '{}' from {}",
                        lp.pid(),
                        String::from_utf8_lossy(message.data()),
                        message.source_pid()
                    );
                    let reply = ResolutionMessage::to_pid(message.source_pid(), "pong");
                    if let Err(e) = lp.submit(reply) {
                        eprintln!("[{}] reply failed: {}", lp.pid(), e);
                    }
                }
            });
        })?;
    }

    lp.on(Trigger::MessageReceived, |lp, args| {
        for message in args.messages() {
            println!(
                "[{}] got '{}' from {}",
                lp.pid(),
                String::from_utf8_lossy(message.data()),
                message.source_pid()
            );
        }
    });
    lp.add_periodic_timer(Duration::from_secs(1), Some(3), true, |lp| {
        if let Err(e) = lp.submit(ResolutionMessage::to_label(GROUP, "ping")) {
            eprintln!("ping failed: {}", e);
        }
    });
    lp.add_periodic_timer(Duration::from_millis(3500), Some(1), false, |lp| lp.stop());

    Ok(lp.run()?)
}

/// A busy child receives one coalescing message per pass however many were
/// queued, but every copy of the plain one
fn run_coalesce(config: LoopConfig) -> Result<i32> {
    let mut lp = new_loop(config)?;

    lp.fork(&[GROUP], |child| {
        child.on(Trigger::MessageReceived, |lp, args| {
            for message in args.messages() {
                println!("[{}] {}", lp.pid(), String::from_utf8_lossy(message.data()));
            }
            println!("[{}] {} messages this pass", lp.pid(), args.len());
            std::thread::sleep(Duration::from_secs(2));
        });
    })?;

    lp.add_periodic_timer(Duration::from_millis(500), None, true, |lp| {
        let mut coalescing = ResolutionMessage::to_label(GROUP, "coalescing message");
        coalescing.set_coalesce(true);
        let plain = ResolutionMessage::to_label(GROUP, "plain message");
        for message in [coalescing, plain] {
            if let Err(e) = lp.submit(message) {
                eprintln!("submit failed: {}", e);
            }
        }
    });
    lp.add_periodic_timer(Duration::from_secs(6), Some(1), false, |lp| lp.stop());

    Ok(lp.run()?)
}

/// P0 forks P1 (which forks its own child) and P2, then shuts the whole
/// tree down
fn run_shutdown(config: LoopConfig) -> Result<i32> {
    let mut lp = new_loop(config)?;

    // Registered before forking, so the branch reports its leaf too
    lp.on(Trigger::ChildTerminated, |lp, args| {
        for process in args.processes() {
            println!("[{}] child {} terminated: {}", lp.pid(), process.pid, process.reason);
        }
    });

    lp.fork(&["branch"], |child| {
        if let Err(e) = child.spawn(&["leaf"]) {
            eprintln!("[{}] fork failed: {}", child.pid(), e);
        }
    })?;
    lp.spawn(&["leaf"])?;

    lp.add_periodic_timer(Duration::from_secs(2), Some(1), false, |lp| {
        if let Err(e) = lp.shutdown() {
            eprintln!("shutdown failed: {}", e);
            lp.stop();
        }
    });

    Ok(lp.run()?)
}

/// Print the root's view of the tree as JSON
fn run_tree(config: LoopConfig) -> Result<i32> {
    let mut lp = new_loop(config)?;

    for labels in [&["worker", "even"][..], &["worker", "odd"][..], &["collector"][..]] {
        lp.spawn(labels)?;
    }

    lp.add_periodic_timer(Duration::from_millis(200), Some(1), false, |lp| {
        match serde_json::to_string_pretty(&lp.process().tree()) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("cannot render the tree: {}", e),
        }
        lp.stop();
    });

    let code = lp.run()?;
    if lp.process().count_children() != 0 {
        return Err(anyhow!("children left behind after stop"));
    }
    Ok(code)
}

fn print_usage() {
    println!("procloop demo daemon v0.1.0");
    println!();
    println!("Usage: procloopd <command>");
    println!();
    println!("Commands:");
    println!("  ping       Route ping/pong messages by label");
    println!("  coalesce   Show message coalescing on a busy child");
    println!("  shutdown   Tear down a two-level process tree");
    println!("  tree       Print the process tree as JSON");
    println!("  -h, --help Show this help message");
    println!();
    println!("Configuration is read from ~/.procloop.rc and PROCLOOP_* variables.");
}
