//! [`SnapshotStore`] backed by the `zfs` command line tool.

use std::process::{Output, Stdio};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;

use super::{Snapshot, SnapshotStore, StoreError};
use crate::config::ZfsConfig;
use crate::dataset::DatasetPath;
use crate::mapping::{DatasetFilter, PrefixFilter};

const NOT_FOUND_MARKER: &str = "does not exist";

#[derive(Debug, Clone)]
pub struct ZfsCli {
    binary: String,
}

impl ZfsCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn from_config(config: &ZfsConfig) -> Self {
        Self::new(config.binary.clone())
    }

    fn command_line(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    async fn run(&self, args: &[&str]) -> Result<String, StoreError> {
        let command = self.command_line(args);
        tracing::debug!(command = %command, "Running zfs command");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| StoreError::Io {
                command: command.clone(),
                source,
            })?;

        check_output(command, output)
    }
}

fn check_output(command: String, output: Output) -> Result<String, StoreError> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    Err(StoreError::Command {
        command,
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Turn a "does not exist" failure into the matching not-found error.
fn or_not_found(err: StoreError, not_found: impl FnOnce() -> StoreError) -> StoreError {
    match &err {
        StoreError::Command { stderr, .. } if stderr.contains(NOT_FOUND_MARKER) => not_found(),
        _ => err,
    }
}

/// `zfs create -p` for the parent of `target`, if it has one. Existing
/// datasets along the way are left alone.
fn create_parents_args(target: &DatasetPath) -> Option<Vec<String>> {
    let parent = target.parent()?;
    Some(vec!["create".to_string(), "-p".to_string(), parent.to_string()])
}

fn parse_snapshot_line(line: &str) -> Result<Snapshot, StoreError> {
    let parse_err = |reason: &str| StoreError::Parse {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let fields: Vec<&str> = line.split('\t').collect();
    let [full_name, guid, creation] = fields.as_slice() else {
        return Err(parse_err("expected name, guid and creation columns"));
    };
    let (_, name) = full_name
        .split_once('@')
        .ok_or_else(|| parse_err("snapshot name has no '@'"))?;
    let guid = guid
        .parse::<u64>()
        .map_err(|_| parse_err("guid is not an integer"))?;
    let creation = creation
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or_else(|| parse_err("creation is not a unix timestamp"))?;

    Ok(Snapshot {
        name: name.to_string(),
        guid,
        creation,
    })
}

#[async_trait]
impl SnapshotStore for ZfsCli {
    async fn list_datasets(
        &self,
        filter: &dyn DatasetFilter,
    ) -> Result<Vec<DatasetPath>, StoreError> {
        let stdout = self
            .run(&["list", "-H", "-o", "name", "-t", "filesystem,volume"])
            .await?;

        let mut datasets = Vec::new();
        for line in stdout.lines().filter(|l| !l.is_empty()) {
            match DatasetPath::parse(line) {
                Ok(path) if filter.filter(&path) => datasets.push(path),
                Ok(_) => {}
                Err(e) => tracing::warn!(line, error = %e, "Skipping unparseable dataset name"),
            }
        }
        datasets.sort();
        Ok(datasets)
    }

    async fn list_snapshots(
        &self,
        dataset: &DatasetPath,
        filter: &PrefixFilter,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let name = dataset.to_string();
        let stdout = self
            .run(&[
                "list",
                "-H",
                "-p",
                "-o",
                "name,guid,creation",
                "-t",
                "snapshot",
                "-s",
                "createtxg",
                "-d",
                "1",
                &name,
            ])
            .await
            .map_err(|e| or_not_found(e, || StoreError::DatasetNotFound(dataset.clone())))?;

        let mut snapshots = Vec::new();
        for line in stdout.lines().filter(|l| !l.is_empty()) {
            let snapshot = parse_snapshot_line(line)?;
            if filter.matches(&snapshot.name) {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn create_snapshot(&self, dataset: &DatasetPath, name: &str) -> Result<(), StoreError> {
        let full = format!("{dataset}@{name}");
        self.run(&["snapshot", &full])
            .await
            .map_err(|e| or_not_found(e, || StoreError::DatasetNotFound(dataset.clone())))?;
        Ok(())
    }

    async fn destroy_snapshot(&self, dataset: &DatasetPath, name: &str) -> Result<(), StoreError> {
        let full = format!("{dataset}@{name}");
        self.run(&["destroy", &full]).await.map_err(|e| {
            or_not_found(e, || StoreError::SnapshotNotFound {
                dataset: dataset.clone(),
                name: name.to_string(),
            })
        })?;
        Ok(())
    }

    async fn receive_snapshot(
        &self,
        source: &DatasetPath,
        snapshot: &Snapshot,
        base: Option<&Snapshot>,
        target: &DatasetPath,
    ) -> Result<(), StoreError> {
        // `zfs recv` does not create missing parents of a new dataset.
        if base.is_none() {
            if let Some(args) = create_parents_args(target) {
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                self.run(&args).await?;
            }
        }

        let full = format!("{source}@{}", snapshot.name);
        let base_arg = base.map(|b| format!("@{}", b.name));
        let mut send_args = vec!["send"];
        if let Some(base_arg) = &base_arg {
            send_args.extend(["-i", base_arg.as_str()]);
        }
        send_args.push(&full);
        let target_name = target.to_string();
        let recv_args = ["recv", "-u", target_name.as_str()];

        let send_command = self.command_line(&send_args);
        let recv_command = self.command_line(&recv_args);
        tracing::debug!(send = %send_command, recv = %recv_command, "Running zfs send | zfs recv");

        let mut send = Command::new(&self.binary)
            .args(&send_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StoreError::Io {
                command: send_command.clone(),
                source,
            })?;

        let pipe: Stdio = send
            .stdout
            .take()
            .ok_or_else(|| StoreError::Unavailable("zfs send has no stdout".to_string()))?
            .try_into()
            .map_err(|source| StoreError::Io {
                command: send_command.clone(),
                source,
            })?;

        let recv = Command::new(&self.binary)
            .args(recv_args)
            .stdin(pipe)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let (send_result, recv_result) = tokio::join!(send.wait_with_output(), recv);

        let recv_output = recv_result.map_err(|source| StoreError::Io {
            command: recv_command.clone(),
            source,
        })?;
        let send_output = send_result.map_err(|source| StoreError::Io {
            command: send_command.clone(),
            source,
        })?;

        check_output(send_command, send_output)?;
        check_output(recv_command, recv_output)?;
        Ok(())
    }
}
