//! Ingestion throughput benchmark
//!
//! Feeds synthetic TCP sessions (or a pcap file) through the flow tracker
//! from several threads and reports packets per second.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use clap::Parser;

use flowmeter::core::{IpProtocol, Packet, PacketNormalizer, TcpFlags};
use flowmeter::engine::{Burst, Emitter, EmitterConfig, EngineStats, NullSink, PacketSource, PcapFileSource};
use flowmeter::flow::{FlowConfig, FlowTable, FlowTracker};

#[derive(Parser, Debug)]
#[command(name = "ingest_benchmark")]
#[command(about = "Benchmark flow ingestion throughput")]
struct Args {
    /// Replay this pcap instead of synthetic traffic
    #[arg(short, long)]
    pcap_path: Option<PathBuf>,

    /// Synthetic sessions
    #[arg(long, default_value = "100000")]
    flows: usize,

    /// Packets per synthetic session
    #[arg(long, default_value = "20")]
    packets_per_flow: usize,

    /// Ingest threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Flow table capacity
    #[arg(long, default_value = "1000000")]
    capacity: usize,

    /// Table shards (0 = auto)
    #[arg(long, default_value = "0")]
    shards: usize,
}

fn tracker(args: &Args) -> anyhow::Result<(Arc<FlowTracker>, Arc<Emitter>, Arc<EngineStats>)> {
    let config = FlowConfig {
        table_capacity: args.capacity,
        shards: args.shards,
        ..FlowConfig::default()
    };
    let stats = Arc::new(EngineStats::new());
    let emitter = Emitter::start(&EmitterConfig::default(), Box::new(NullSink), stats.clone())?;
    let table = Arc::new(FlowTable::new(&config));
    let tracker = Arc::new(FlowTracker::new(&config, table, emitter.clone(), stats.clone()));
    Ok((tracker, emitter, stats))
}

fn session_packets(flow: usize, count: usize) -> Vec<Packet> {
    let start = Utc::now();
    let client = IpAddr::V4(Ipv4Addr::from(0x0a00_0000 | (flow as u32 & 0x00ff_ffff)));
    let server = IpAddr::V4(Ipv4Addr::new(192, 168, 100, 1));
    let port = 1024 + (flow % 60_000) as u16;

    (0..count)
        .map(|i| {
            let flags = match i {
                0 => TcpFlags::SYN,
                _ if i + 2 == count => TcpFlags::FIN | TcpFlags::ACK,
                _ if i + 1 == count => TcpFlags::FIN | TcpFlags::ACK,
                _ => TcpFlags::PSH | TcpFlags::ACK,
            };
            let pkt = Packet::new(start + Duration::microseconds(i as i64 * 250), client, port, server, 443, IpProtocol::Tcp)
                .with_length(64 + (i as u32 * 37) % 1400)
                .with_tcp_flags(TcpFlags::from_u8(flags))
                .with_window(65535);
            if i % 2 == 0 { pkt } else { pkt.reversed() }
        })
        .collect()
}

fn run_synthetic(args: &Args) -> anyhow::Result<()> {
    let (tracker, emitter, stats) = tracker(args)?;
    let threads = args.threads.max(1);
    let per_thread = args.flows / threads;

    println!(
        "Synthetic: {} flows x {} packets on {} threads",
        per_thread * threads,
        args.packets_per_flow,
        threads
    );

    let started = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tracker = tracker.clone();
            let packets_per_flow = args.packets_per_flow;
            std::thread::spawn(move || {
                for f in 0..per_thread {
                    for pkt in session_packets(t * per_thread + f, packets_per_flow) {
                        tracker.ingest_packet(&pkt).expect("ingest");
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker");
    }
    tracker.flush_all();
    emitter.close();
    report(started, &stats);
    Ok(())
}

fn run_pcap(args: &Args, path: &PathBuf) -> anyhow::Result<()> {
    let (tracker, emitter, stats) = tracker(args)?;
    let mut source = PcapFileSource::open(path)?;
    let normalizer = PacketNormalizer::new(source.link_layer());

    println!("Replaying {}", path.display());
    let started = Instant::now();
    while let Burst::Frames(frames) = source.next_burst(256)? {
        tracker.ingest_burst(&normalizer, &frames)?;
    }
    tracker.flush_all();
    emitter.close();
    report(started, &stats);
    Ok(())
}

fn report(started: Instant, stats: &EngineStats) {
    let elapsed = started.elapsed();
    let snap = stats.snapshot();
    let pps = snap.packets_processed as f64 / elapsed.as_secs_f64();

    println!("  elapsed:      {:?}", elapsed);
    println!("  packets:      {}", snap.packets_processed);
    println!("  malformed:    {}", snap.packets_malformed);
    println!("  flows:        {} created, {} finalized", snap.flows_created, snap.flows_finalized());
    println!("  records:      {} emitted, {} dropped", snap.records_emitted, snap.records_dropped);
    println!("  throughput:   {:.0} packets/s", pps);
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match &args.pcap_path {
        Some(path) => run_pcap(&args, path),
        None => run_synthetic(&args),
    }
}
