use std::collections::BTreeSet;
use std::thread;

use anyhow::{anyhow, Result};

use rwbench::bench::{
    addr, aggregate, BenchConfig, BenchError, BenchReport, Client, ReapMode, Server,
    ServerSummary,
};
use rwbench::ctrl::{ConnState, DESCRIPTOR_LEN};
use rwbench::rdma::cm::REJECT_CONSUMER_DEFINED;
use rwbench::wrap::DurableFile;
use rwbench::{CmEventType, DeviceAttr, Fabric, MrRemote, WcStatus};

fn config(connections: usize) -> BenchConfig {
    BenchConfig {
        connections,
        message_size: 64,
        duration_ms: 50,
        prepare_ms: 0,
        cm_timeout_ms: Some(10_000),
        ..Default::default()
    }
}

/// Run a server and a client to completion on a fresh fabric.
fn run_pair(
    fabric: &Fabric,
    server_cfg: &BenchConfig,
    client_cfg: &BenchConfig,
) -> Result<(Server, Client, ServerSummary, BenchReport)> {
    let addrs = addr::resolve(None, "127.0.0.1", server_cfg.port)?;
    let mut server = Server::bind(fabric, server_cfg, addrs.dst)?;
    let mut client = Client::new(fabric, client_cfg, addrs)?;
    let (summary, report) = thread::scope(|s| -> Result<_> {
        let srv = s.spawn(|| server.run());
        let report = client.run()?;
        let summary = srv.join().map_err(|_| anyhow!("server panicked"))??;
        Ok((summary, report))
    })?;
    Ok((server, client, summary, report))
}

#[test]
fn single_connection() -> Result<()> {
    let fabric = Fabric::new("soft0", DeviceAttr::default());
    let cfg = config(1);
    let addrs = addr::resolve(None, "127.0.0.1", cfg.port)?;
    let mut server = Server::bind(&fabric, &cfg, addrs.dst)?;
    let mut client = Client::new(&fabric, &cfg, addrs)?;

    // Connect and exchange first, so both descriptors can be compared while
    // the connections still hold them.
    let accepted = thread::scope(|s| -> Result<_> {
        let srv = s.spawn(|| server.accept());
        assert_eq!(client.connect()?, 1);
        assert_eq!(client.exchange(), 1);
        Ok(srv.join().map_err(|_| anyhow!("server panicked"))??)
    })?;
    assert_eq!(accepted, 1);

    let published = server.endpoint().arena().get(0).and_then(|c| c.remote());
    let received = client.endpoint().arena().get(0).and_then(|c| c.remote());
    assert!(published.is_some());
    assert_eq!(published, received);
    assert_eq!(received.map(|r| r.len), Some(64));

    let report = thread::scope(|s| -> Result<_> {
        let srv = s.spawn(|| server.wait_disconnects());
        let stats = client.benchmark(client.jobs());
        client.disconnect()?;
        srv.join().map_err(|_| anyhow!("server panicked"))??;
        Ok(aggregate(&stats, cfg.message_size))
    })?;

    let summary = server.summary();
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.exchanged, 1);
    assert_eq!(report.workers, 1);
    assert_eq!(report.failed_workers, 0);
    assert!(report.ops > 0);
    assert!(report.mean_latency_ns > 0);
    assert!(report.throughput_bps > 0.0);
    assert_eq!(report.bytes, report.ops * 64);

    // Closed connections no longer hold a descriptor.
    assert!(server.endpoint().arena().iter().all(|c| c.remote().is_none()));
    assert!(client.endpoint().arena().iter().all(|c| c.remote().is_none()));

    assert_eq!(server.endpoint().channel().unacked(), 0);
    assert_eq!(client.endpoint().channel().unacked(), 0);
    assert!(client
        .endpoint()
        .arena()
        .iter()
        .all(|c| c.state() == ConnState::Closed));

    drop((server, client));
    assert!(fabric.context().unwrap().usage().is_empty());
    Ok(())
}

#[test]
fn descriptors_are_dropped_after_a_full_run() -> Result<()> {
    let fabric = Fabric::new("soft0", DeviceAttr::default());
    let (server, client, summary, _) = run_pair(&fabric, &config(2), &config(2))?;
    assert_eq!(summary.exchanged, 2);
    for endpoint in [server.endpoint(), client.endpoint()] {
        assert_eq!(endpoint.arena().len(), 2);
        assert!(endpoint.arena().iter().all(|c| c.remote().is_none()));
        assert!(endpoint.arena().iter().all(|c| c.resources().is_none()));
    }
    Ok(())
}

#[test]
fn server_with_spare_capacity_serves_a_smaller_client() -> Result<()> {
    let fabric = Fabric::new("soft0", DeviceAttr::default());
    let server_cfg = BenchConfig {
        cm_timeout_ms: Some(1000),
        ..config(2)
    };
    let client_cfg = config(1);
    let addrs = addr::resolve(None, "127.0.0.1", server_cfg.port)?;
    let mut server = Server::bind(&fabric, &server_cfg, addrs.dst)?;
    let mut client = Client::new(&fabric, &client_cfg, addrs)?;

    let (accepted, report) = thread::scope(|s| -> Result<_> {
        let srv = s.spawn(|| server.accept());
        // The client gets its descriptor without the server's second slot
        // ever being filled.
        let report = client.run()?;
        let accepted = srv.join().map_err(|_| anyhow!("server panicked"))?;
        Ok((accepted, report))
    })?;

    assert_eq!(report.workers, 1);
    assert_eq!(report.failed_workers, 0);
    assert!(report.ops > 0);
    assert!(matches!(accepted, Err(BenchError::Timeout(_))));

    let summary = server.summary();
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.exchanged, 1);
    assert_eq!(server.endpoint().context().connects_left(), 1);
    assert_eq!(server.endpoint().context().disconnects_left(), 0);
    assert_eq!(server.endpoint().channel().unacked(), 0);
    assert_eq!(client.endpoint().channel().unacked(), 0);
    Ok(())
}

#[test]
fn one_second_run() -> Result<()> {
    let fabric = Fabric::new("soft0", DeviceAttr::default());
    let cfg = BenchConfig {
        duration_ms: 1000,
        ..config(1)
    };
    let (_server, _client, summary, report) = run_pair(&fabric, &cfg, &cfg)?;

    assert_eq!(summary.exchanged, 1);
    assert_eq!(report.message_size, 64);
    assert_eq!(report.failed_workers, 0);
    assert!(report.ops > 0);
    assert!(report.elapsed_ns >= 900_000_000);
    assert_eq!(report.bytes, report.ops * 64);
    let expected = report.bytes as f64 / (report.elapsed_ns as f64 / 1e9);
    assert!((report.throughput_bps - expected).abs() <= expected * 1e-9);
    Ok(())
}

#[test]
fn extra_request_is_rejected() -> Result<()> {
    let fabric = Fabric::new("soft0", DeviceAttr::default());
    let (server, client, summary, report) = run_pair(&fabric, &config(2), &config(3))?;

    assert_eq!(summary.accepted, 2);
    assert_eq!(server.endpoint().arena().len(), 2);
    assert_eq!(server.endpoint().context().connects_left(), 0);
    assert_eq!(client.endpoint().context().connects_left(), 0);
    assert_eq!(report.workers, 2);
    assert_eq!(report.failed_workers, 0);

    let rejected: Vec<_> = client
        .endpoint()
        .errors()
        .iter()
        .filter(|(_, e)| {
            matches!(
                e,
                BenchError::ConnectionError {
                    event: CmEventType::Rejected,
                    status: REJECT_CONSUMER_DEFINED,
                }
            )
        })
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(
        client
            .endpoint()
            .arena()
            .iter()
            .filter(|c| c.state() == ConnState::Failed)
            .count(),
        1
    );
    Ok(())
}

#[test]
fn corrupted_key_stops_only_its_worker() -> Result<()> {
    let fabric = Fabric::new("soft0", DeviceAttr::default());
    let cfg = config(2);
    let addrs = addr::resolve(None, "127.0.0.1", cfg.port)?;
    let mut server = Server::bind(&fabric, &cfg, addrs.dst)?;
    let mut client = Client::new(&fabric, &cfg, addrs)?;

    let stats = thread::scope(|s| -> Result<_> {
        let srv = s.spawn(|| server.run());
        assert_eq!(client.connect()?, 2);
        assert_eq!(client.exchange(), 2);

        let mut jobs = client.jobs();
        let victim = jobs[1].index();
        let remote = client
            .endpoint()
            .arena()
            .get(victim)
            .and_then(|c| c.remote())
            .ok_or_else(|| anyhow!("no descriptor"))?;
        jobs[1].retarget(MrRemote {
            rkey: remote.rkey ^ 0x00ff_00ff,
            ..remote
        });
        let stats = client.benchmark(jobs);

        client.disconnect()?;
        srv.join().map_err(|_| anyhow!("server panicked"))??;
        Ok(stats)
    })?;

    assert_eq!(stats.len(), 2);
    assert!(stats[0].error.is_none());
    assert!(stats[0].ops > 0);
    assert!(matches!(
        stats[1].error,
        Some(BenchError::Completion {
            status: WcStatus::RemAccessErr,
            ..
        })
    ));
    assert_eq!(stats[1].ops, 0);
    assert_eq!(client.endpoint().channel().unacked(), 0);
    Ok(())
}

#[test]
fn blocking_reap_mode() -> Result<()> {
    let fabric = Fabric::new("soft0", DeviceAttr::default());
    let cfg = BenchConfig {
        reap_mode: ReapMode::Blocking,
        queue_depth: 4,
        ..config(2)
    };
    let (server, client, summary, report) = run_pair(&fabric, &cfg, &cfg)?;

    assert_eq!(summary.exchanged, 2);
    assert_eq!(report.workers, 2);
    assert_eq!(report.failed_workers, 0);
    assert!(report.rows.iter().all(|r| r.ops > 0));
    assert_eq!(server.endpoint().channel().unacked(), 0);
    assert_eq!(client.endpoint().channel().unacked(), 0);
    Ok(())
}

#[test]
fn durable_regions_hold_the_written_data() -> Result<()> {
    let path = std::env::temp_dir().join(format!("rwbench-loopback-{}", std::process::id()));
    let fabric = Fabric::new("soft0", DeviceAttr::default());
    let cfg = BenchConfig {
        durable_path: Some(path.clone()),
        ..config(2)
    };
    let (_server, _client, _, report) = run_pair(&fabric, &cfg, &config(2))?;
    assert_eq!(report.failed_workers, 0);

    let file = DurableFile::open(&path)?;
    assert!(file.len() >= 2 * 64);
    // SAFETY: the mapping is valid for its whole length and nothing else
    // writes to it any more.
    let bytes = unsafe { std::slice::from_raw_parts(file.as_ptr(), 2 * 64) };
    let mut seen = BTreeSet::new();
    for chunk in bytes.chunks(64) {
        assert!(chunk.iter().all(|&b| b == chunk[0]));
        seen.insert(chunk[0]);
    }
    assert_eq!(seen, BTreeSet::from([b'A', b'B']));

    drop(file);
    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn durable_file_too_small() -> Result<()> {
    let path = std::env::temp_dir().join(format!("rwbench-small-{}", std::process::id()));
    drop(DurableFile::create(&path, DESCRIPTOR_LEN)?);
    let fabric = Fabric::new("soft0", DeviceAttr::default());
    let cfg = BenchConfig {
        durable_path: Some(path.clone()),
        ..config(2)
    };
    let addrs = addr::resolve(None, "127.0.0.1", cfg.port)?;
    assert!(matches!(
        Server::bind(&fabric, &cfg, addrs.dst),
        Err(BenchError::Config(_))
    ));
    std::fs::remove_file(&path)?;
    Ok(())
}
