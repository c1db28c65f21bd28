// Node Runner - one ring node as an OS process over UDP
//
// Usage:
//   cargo run --bin node_runner -- --id 0 --port 6000 --next-port 6001
//   cargo run --bin node_runner -- --id 0 --port 6000 --next-port 6000 --inject
//   cargo run --bin node_runner -- --id 2 --port 6002 --next-port 6003 --next-host 10.0.0.7

use std::env;
use std::net::UdpSocket;
use std::process::exit;
use std::time::Duration;

use log::{error, info};
use simple_logger::SimpleLogger;

use ringq::{
    EventSink, NodeConfig, NodeEvent, NodeId, NoOpSink, RingNode, StdDraw, Token, UdpFanout,
    UdpTokenLink, DEFAULT_HOP_DELAY_MS,
};

// ============================================================================
// Console Event Sink
// ============================================================================

/// Logging event sink that prints node events to the console
struct ConsoleEventSink;

impl EventSink for ConsoleEventSink {
    fn log(&mut self, node: NodeId, event: NodeEvent) {
        match event {
            NodeEvent::TokenReceived { round, silent_rounds } => {
                println!("{:>3} TokenReceived    round:{} silent:{}", node, round, silent_rounds)
            }
            NodeEvent::ActivityEmitted { round } => {
                println!("{:>3} ActivityEmitted  round:{}", node, round)
            }
            NodeEvent::SilentHop { observed } => {
                println!("{:>3} SilentHop        observed:{}", node, observed)
            }
            NodeEvent::QuiescenceDetected { round, silent_rounds } => {
                println!("{:>3} Quiescence       round:{} silent:{}", node, round, silent_rounds)
            }
            NodeEvent::TerminationRelayed { round } => {
                println!("{:>3} TerminalRelay    round:{}", node, round)
            }
            NodeEvent::TokenForwarded { round, duration_secs } => {
                println!("{:>3} TokenForwarded   round:{} hop:{:.6}s", node, round, duration_secs)
            }
        }
    }
}

// ============================================================================
// Argument Parsing
// ============================================================================

struct NodeArgs {
    id: NodeId,
    host: String,
    port: u16,
    next_host: String,
    next_port: u16,
    initial_p: f64,
    k: u64,
    hop_delay_ms: u64,
    inject: bool,
    verbose: bool,
    seed: Option<[u8; 32]>,
}

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} --id N --port PORT --next-port PORT [options]",
        program
    );
    eprintln!("\nOptions:");
    eprintln!("  --host ADDR         own listening host (default 127.0.0.1)");
    eprintln!("  --next-host ADDR    successor's host (default 127.0.0.1)");
    eprintln!("  --initial-p F       initial event probability in (0,1] (default 0.5)");
    eprintln!("  --k N               silent rounds required to terminate (default 5)");
    eprintln!("  --hop-delay-ms N    artificial delay before each forward (default {})", DEFAULT_HOP_DELAY_MS);
    eprintln!("  --seed HEX          32-byte draw seed, e.g. 0x1234...");
    eprintln!("  --inject            send the initial token to this node on startup");
    eprintln!("  --verbose           print per-hop events");
    exit(1);
}

fn parse_seed_hex(hex: &str) -> [u8; 32] {
    let hex = hex.trim_start_matches("0x");
    let mut seed = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).take(32).enumerate() {
        let s = std::str::from_utf8(chunk).unwrap_or("0");
        seed[i] = u8::from_str_radix(s, 16).unwrap_or(0);
    }
    seed
}

fn parse_args() -> NodeArgs {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut parsed = NodeArgs {
        id: 0,
        host: "127.0.0.1".to_string(),
        port: 0,
        next_host: "127.0.0.1".to_string(),
        next_port: 0,
        initial_p: 0.5,
        k: 5,
        hop_delay_ms: DEFAULT_HOP_DELAY_MS,
        inject: false,
        verbose: false,
        seed: None,
    };
    let mut have_id = false;
    let mut have_port = false;
    let mut have_next_port = false;

    let mut i = 1;
    while i < args.len() {
        let take_value = |i: &mut usize| -> String {
            *i += 1;
            if *i >= args.len() {
                usage(&program);
            }
            args[*i].clone()
        };

        match args[i].as_str() {
            "--id" => {
                parsed.id = take_value(&mut i).parse().unwrap_or_else(|_| usage(&program));
                have_id = true;
            }
            "--host" => parsed.host = take_value(&mut i),
            "--port" => {
                parsed.port = take_value(&mut i).parse().unwrap_or_else(|_| usage(&program));
                have_port = true;
            }
            "--next-host" => parsed.next_host = take_value(&mut i),
            "--next-port" => {
                parsed.next_port = take_value(&mut i).parse().unwrap_or_else(|_| usage(&program));
                have_next_port = true;
            }
            "--initial-p" => {
                parsed.initial_p = take_value(&mut i).parse().unwrap_or_else(|_| usage(&program))
            }
            "--k" => parsed.k = take_value(&mut i).parse().unwrap_or_else(|_| usage(&program)),
            "--hop-delay-ms" => {
                parsed.hop_delay_ms =
                    take_value(&mut i).parse().unwrap_or_else(|_| usage(&program))
            }
            "--seed" => parsed.seed = Some(parse_seed_hex(&take_value(&mut i))),
            "--inject" => parsed.inject = true,
            "--verbose" => parsed.verbose = true,
            _ => usage(&program),
        }
        i += 1;
    }

    if !have_id || !have_port || !have_next_port {
        usage(&program);
    }
    if !(parsed.initial_p > 0.0 && parsed.initial_p <= 1.0) {
        eprintln!("--initial-p must be in (0, 1]");
        exit(1);
    }
    if parsed.k == 0 {
        eprintln!("--k must be at least 1");
        exit(1);
    }

    parsed
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    SimpleLogger::new().init().unwrap();

    let args = parse_args();

    let mut config = NodeConfig::new(
        args.id,
        &format!("{}:{}", args.host, args.port),
        &format!("{}:{}", args.next_host, args.next_port),
    );
    config.initial_probability = args.initial_p;
    config.silence_threshold = args.k;
    config.hop_delay = Duration::from_millis(args.hop_delay_ms);
    config.inject_token = args.inject;

    info!(
        "node {}: starting with p0={} k={}",
        args.id, args.initial_p, args.k
    );

    let link = match UdpTokenLink::bind(&config.listen_addr, &config.successor_addr) {
        Ok(link) => link,
        Err(e) => {
            error!("node {}: failed to bind {}: {}", args.id, config.listen_addr, e);
            exit(1);
        }
    };

    let sink: Box<dyn EventSink + Send> = if args.verbose {
        Box::new(ConsoleEventSink)
    } else {
        Box::new(NoOpSink)
    };

    let mut node = RingNode::new_with_sink(
        config.clone(),
        link,
        UdpFanout::activity(),
        UdpFanout::telemetry(),
        sink,
    );
    if let Some(mut seed) = args.seed {
        // distinct per-node streams from one experiment seed
        seed[0] ^= args.id as u8;
        node.set_draw(Box::new(StdDraw::from_seed(seed)));
    }

    // The listening socket is already bound, so the injected token cannot
    // be lost between here and the receive loop.
    if config.inject_token {
        if let Err(e) = inject_initial_token(&config.listen_addr) {
            error!("node {}: failed to inject initial token: {}", args.id, e);
            exit(1);
        }
        info!("node {}: initial token injected", args.id);
    }

    match node.run() {
        Ok(report) => {
            info!(
                "node {}: finished after {} rounds with {} events ({:?})",
                report.node, report.rounds_processed, report.events_emitted, report.outcome
            );
        }
        Err(e) => {
            error!("node {}: fatal: {}", args.id, e);
            exit(1);
        }
    }
}

fn inject_initial_token(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.send_to(&Token::new().to_wire()?, addr)?;
    Ok(())
}
