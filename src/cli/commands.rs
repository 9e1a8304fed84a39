//! CLI command implementations
//!
//! `simulate` runs the full segment lifecycle against a simulated cluster:
//! open, append, optional backup crash, close, sync, verify, free and
//! shutdown. `check-config` validates a config file.

use std::path::Path;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde_json::{json, Value};

use crate::replication::{
    BackupManager, ClusterMembership, ReplicationConfig, SegmentHandle, ServerId,
};
use crate::sim::SimulatedCluster;

use super::args::{Command, SimulateArgs};
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Master identity used by simulations
const SIM_MASTER: ServerId = ServerId(0);

/// Run a CLI command
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Simulate(args) => write_response(simulate(&args)?),
        Command::CheckConfig { config } => write_response(check_config(&config)?),
    }
}

/// Load and validate a config file, returning it as JSON.
pub fn check_config(path: &Path) -> CliResult<Value> {
    let config = ReplicationConfig::load(path)?;
    Ok(serde_json::to_value(&config)?)
}

/// Resolve the replication config for a simulation run.
fn simulation_config(args: &SimulateArgs) -> CliResult<ReplicationConfig> {
    let mut config = match &args.config {
        Some(path) => ReplicationConfig::load(path)?,
        None => ReplicationConfig::default(),
    };
    if let Some(replicas) = args.replicas {
        config.num_replicas = replicas;
    }
    config.validate()?;

    if !(0.0..1.0).contains(&args.failure_rate) {
        return Err(CliError::config_error(format!(
            "failure rate must be in [0, 1), got {}",
            args.failure_rate
        )));
    }
    let survivors = args.backups - u64::from(args.kill_after.is_some() && args.backups > 0);
    if survivors < u64::from(config.num_replicas) {
        // sync would wait forever for backups that never appear
        return Err(CliError::config_error(format!(
            "{} replicas need at least {} live backups, simulation keeps {}",
            config.num_replicas, config.num_replicas, survivors
        )));
    }
    Ok(config)
}

struct SimSegment {
    id: u64,
    handle: SegmentHandle,
    contents: Bytes,
}

/// Size of the view handed over after `step` of `steps` appends.
fn view_len(total: usize, step: u32, steps: u32) -> usize {
    total * step as usize / steps as usize
}

/// Run a simulation and return its report.
pub fn simulate(args: &SimulateArgs) -> CliResult<Value> {
    let config = simulation_config(args)?;
    let cluster = SimulatedCluster::with_backups(args.backups)
        .with_failure_rate(args.failure_rate, args.seed);
    cluster.set_latency(args.latency);

    let mut manager = BackupManager::new(
        Some(cluster.membership()),
        cluster.transport(),
        SIM_MASTER,
        config.clone(),
    )?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let steps = args.appends + 1;
    let first_view = (args.segment_bytes / steps as usize).min(config.max_rpc_bytes as usize);

    let mut segments = Vec::new();
    for id in 1..=args.segments {
        let mut contents = vec![0u8; args.segment_bytes];
        rng.fill_bytes(&mut contents);
        let contents = Bytes::from(contents);

        let handle = manager.open_segment(id, contents.slice(0..first_view))?;
        segments.push(SimSegment {
            id,
            handle,
            contents,
        });
        manager.proceed();

        if args.kill_after == Some(id) && args.backups > 0 {
            cluster.kill(ServerId(1));
            manager.cluster_configuration_changed();
        }
    }

    for step in 2..=steps {
        for segment in &segments {
            let len = view_len(args.segment_bytes, step, steps).max(first_view);
            manager.write(segment.handle, segment.contents.slice(0..len))?;
        }
        manager.proceed();
    }

    for segment in &segments {
        // Segments shorter than one append still end at their full size.
        manager.write(segment.handle, segment.contents.clone())?;
        manager.close(segment.handle)?;
    }
    manager.sync();

    let mut report = Vec::new();
    for segment in &segments {
        report.push(verify_segment(&manager, &cluster, segment)?);
    }

    for segment in &segments {
        manager.free_segment(segment.id)?;
    }
    manager.shutdown();

    Ok(json!({
        "master": SIM_MASTER,
        "config": serde_json::to_value(&config)?,
        "backups": {
            "total": args.backups,
            "live": cluster.live_backups().len(),
        },
        "requests": cluster.requests().len(),
        "metrics": manager.metrics().to_json(),
        "segments": report,
    }))
}

/// Check that every assigned backup holds exactly the segment's bytes.
fn verify_segment(
    manager: &BackupManager,
    cluster: &SimulatedCluster,
    segment: &SimSegment,
) -> CliResult<Value> {
    if !manager.is_synced(segment.handle) {
        return Err(CliError::verification_failed(format!(
            "segment {} not synced after sync()",
            segment.id
        )));
    }

    let expected = crc32fast::hash(&segment.contents);
    let backups: Vec<ServerId> = manager
        .replica_backups(segment.handle)?
        .into_iter()
        .flatten()
        .collect();
    for backup in &backups {
        let checksum = cluster.replica_checksum(*backup, SIM_MASTER, segment.id);
        if checksum != Some(expected) {
            return Err(CliError::verification_failed(format!(
                "segment {} on {} has checksum {:?}, expected {}",
                segment.id, backup, checksum, expected
            )));
        }
        if !cluster.is_closed(*backup, SIM_MASTER, segment.id) {
            return Err(CliError::verification_failed(format!(
                "segment {} on {} never received the close flag",
                segment.id, backup
            )));
        }
    }

    Ok(json!({
        "id": segment.id,
        "bytes": segment.contents.len(),
        "checksum": expected,
        "backups": backups,
    }))
}
