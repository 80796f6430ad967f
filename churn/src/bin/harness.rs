//! Churn harness entry point.
//!
//! Builds the fan-out topology for the configured leaf set, expands the
//! session command templates, and runs the event-driven controller over
//! a pool of real session processes.
//!
//! # Usage
//!
//! ```sh
//! churn-harness --clients 100 --lambda-in 20 --lambda-out 0.0667 --time 60 --output results.csv
//! ```
//!
//! Flags given after `--config` override values from the file.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use churn::config::{ConfigError, HarnessConfig};
use churn::process::ProcessPool;
use churn::runtime::Controller;
use churn::session::{SessionDescriptor, SessionId};
use churn::sink::RelaySink;
use churn::topology::build_tree;

fn main() {
    if let Err(e) = run() {
        eprintln!("churn-harness: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let config = parse_args(&args)?;
    config.validate()?;

    churn::init_tracing();

    let leaves = config.leaf_names();
    let tree = build_tree(&leaves, config.capacity)?;
    eprintln!(
        "churn-harness: {} leaves, {} aggregation node(s){}",
        leaves.len(),
        tree.node_count(),
        if tree.root_link.is_some() {
            ", linked root pair"
        } else {
            ""
        }
    );

    let mut servers = Vec::with_capacity(config.servers);
    let mut clients = Vec::with_capacity(config.clients);
    for (index, name) in leaves.iter().enumerate() {
        let id = SessionId::new(name.clone());
        let template = if index < config.servers {
            &config.server_command
        } else {
            &config.client_command
        };
        let descriptor = SessionDescriptor::from_template(template, &id, index)
            .ok_or_else(|| invalid("empty session command template"))?;
        if index < config.servers {
            servers.push((id, descriptor));
        } else {
            clients.push((id, descriptor));
        }
    }

    let sink = match &config.output {
        Some(path) => RelaySink::to_file(path)?,
        None => RelaySink::to_stdout()?,
    };

    let stop = Arc::new(AtomicBool::new(false));
    register_stop_signals(&stop)?;

    let pool = ProcessPool::new()?;
    let mut controller = Controller::new(&config, servers, clients, pool, sink, stop);

    eprintln!("churn-harness: running");
    let stats = controller.run()?;
    eprintln!(
        "churn-harness: done ({} arrivals, {} spawns, {} departures, peak {} active)",
        stats.arrival_events, stats.spawns, stats.departures, stats.peak_active
    );
    Ok(())
}

/// Sets the stop flag on SIGINT or SIGTERM.
///
/// The controller polls the flag once per loop iteration, and the
/// signal interrupts its blocking wait (EINTR), so an interrupt drains
/// through the normal exit path: the sink is flushed and the process
/// pool terminates and reaps its children on drop.
fn register_stop_signals(stop: &Arc<AtomicBool>) -> Result<(), std::io::Error> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(stop))?;
    Ok(())
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        msg.into(),
    ))
}

fn parse_args(args: &[String]) -> Result<HarnessConfig, ConfigError> {
    let mut config = HarnessConfig::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let value = take_value(args, &mut i, flag)?;
                config = HarnessConfig::load(&PathBuf::from(value))?;
            }
            "--clients" | "-n" => {
                config.clients = parse_value(args, &mut i, flag)?;
            }
            "--servers" => {
                config.servers = parse_value(args, &mut i, flag)?;
            }
            "--capacity" | "-p" => {
                config.capacity = parse_value(args, &mut i, flag)?;
            }
            "--lambda-in" => {
                config.arrival_rate = parse_value(args, &mut i, flag)?;
            }
            "--lambda-out" => {
                config.departure_rate = parse_value(args, &mut i, flag)?;
            }
            "--time" | "-t" => {
                config.run_secs = Some(parse_value(args, &mut i, flag)?);
            }
            "--output" | "-o" => {
                config.output = Some(PathBuf::from(take_value(args, &mut i, flag)?));
            }
            "--seed" => {
                config.seed = Some(parse_value(args, &mut i, flag)?);
            }
            arg => {
                return Err(invalid(format!("unknown argument: {arg}")));
            }
        }
        i += 1;
    }

    Ok(config)
}

fn take_value<'a>(
    args: &'a [String],
    i: &mut usize,
    flag: &str,
) -> Result<&'a str, ConfigError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| invalid(format!("missing value for {flag}")))
}

fn parse_value<T: std::str::FromStr>(
    args: &[String],
    i: &mut usize,
    flag: &str,
) -> Result<T, ConfigError> {
    let value = take_value(args, i, flag)?;
    value
        .parse()
        .map_err(|_| invalid(format!("invalid value for {flag}: {value}")))
}

fn print_usage() {
    eprintln!(
        "Usage: churn-harness [OPTIONS]

Options:
  -c, --config <FILE>     Load configuration from a TOML file
  -n, --clients <N>       Idle client pool size (default 100)
      --servers <N>       Servers spawned up-front (default 1)
  -p, --capacity <N>      Fan-out per aggregation node (default 64)
      --lambda-in <RATE>  Arrival rate, sessions per second (default 10)
      --lambda-out <RATE> Departure rate per active session (default 0.1)
  -t, --time <SECS>       Finite run duration; omit to run until interrupted
  -o, --output <FILE>     Relay output to a file instead of stdout
      --seed <N>          Seed the stochastic processes deterministically
  -h, --help              Show this help"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn interrupt_signal_sets_the_stop_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        register_stop_signals(&stop).unwrap();

        signal_hook::low_level::raise(signal_hook::consts::SIGINT).unwrap();
        // raise() delivers to the calling thread synchronously, but give
        // the handler a little slack on slow machines.
        for _ in 0..100 {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(stop.load(Ordering::Relaxed));
    }
}
