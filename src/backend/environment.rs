//! Ephemeral execution environments for backend engines.
//!
//! [`ExecutionEnvironment`] is the container-runtime boundary: launch an image,
//! run a command inside it, copy a file out, kill it. [`DockerEnvironment`]
//! drives the `docker` CLI. [`ManagedEnvironment`] owns at most one running
//! instance and guarantees it is killed on release or drop; both backends hold
//! one.

use crate::error::{EvalError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Output};
use tracing::{debug, info, warn};

/// A host path mounted into the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// What to launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    /// Pull the image before launching.
    pub pull: bool,
    /// Allocate a TTY so images with an interactive entrypoint stay up.
    pub tty: bool,
}

impl LaunchSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }
}

/// Container runtime operations used by the backends.
pub trait ExecutionEnvironment: Send + Sync {
    /// Start a detached instance and return its identifier.
    fn launch(&self, spec: &LaunchSpec) -> Result<String>;

    /// Run `command` inside the instance and return its exit status.
    fn exec(&self, id: &str, command: &[String], workdir: &str) -> Result<i32>;

    /// Copy `path` out of the instance as a tar stream.
    fn copy_out(&self, id: &str, path: &str) -> Result<Vec<u8>>;

    fn kill(&self, id: &str) -> Result<()>;
}

/// [`ExecutionEnvironment`] backed by the docker command-line client.
#[derive(Debug, Clone)]
pub struct DockerEnvironment {
    binary: String,
}

impl DockerEnvironment {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[String]) -> Result<Output> {
        debug!(binary = %self.binary, ?args, "running container command");
        Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| EvalError::Environment(format!("failed to run {}: {e}", self.binary)))
    }

    fn run_checked(&self, args: &[String]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(EvalError::Environment(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    fn run_args(spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--network".to_string(),
            "host".to_string(),
        ];
        if spec.tty {
            args.push("-t".to_string());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &spec.mounts {
            let mode = if mount.read_only { ":ro" } else { "" };
            args.push("-v".to_string());
            args.push(format!("{}:{}{mode}", mount.host.display(), mount.target));
        }
        args.push(spec.image.clone());
        args
    }
}

impl Default for DockerEnvironment {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ExecutionEnvironment for DockerEnvironment {
    fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        if spec.pull {
            info!(image = %spec.image, "pulling image");
            self.run_checked(&["pull".to_string(), spec.image.clone()])?;
        }
        let output = self.run_checked(&Self::run_args(spec))?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(EvalError::Environment(format!(
                "no container id returned for {}",
                spec.image
            )));
        }
        Ok(id)
    }

    fn exec(&self, id: &str, command: &[String], workdir: &str) -> Result<i32> {
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            workdir.to_string(),
            id.to_string(),
        ];
        args.extend(command.iter().cloned());
        let output = self.run(&args)?;
        debug!(
            container = id,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "exec finished"
        );
        output.status.code().ok_or_else(|| {
            EvalError::Environment(format!("exec in {id} was terminated by a signal"))
        })
    }

    fn copy_out(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let output = self.run_checked(&["cp".to_string(), format!("{id}:{path}"), "-".to_string()])?;
        Ok(output.stdout)
    }

    fn kill(&self, id: &str) -> Result<()> {
        self.run_checked(&["kill".to_string(), id.to_string()])?;
        Ok(())
    }
}

/// Owns at most one running instance of an [`ExecutionEnvironment`].
pub struct ManagedEnvironment {
    runtime: Box<dyn ExecutionEnvironment>,
    current: Option<String>,
}

impl ManagedEnvironment {
    pub fn new(runtime: Box<dyn ExecutionEnvironment>) -> Self {
        Self {
            runtime,
            current: None,
        }
    }

    pub fn docker(binary: impl Into<String>) -> Self {
        Self::new(Box::new(DockerEnvironment::new(binary)))
    }

    /// Launch `spec`, releasing any instance that is still running.
    pub fn launch(&mut self, spec: &LaunchSpec) -> Result<&str> {
        self.release()?;
        let id = self.runtime.launch(spec)?;
        info!(image = %spec.image, container = %id, "launched environment");
        Ok(self.current.insert(id).as_str())
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    pub fn exec(&self, command: &[String], workdir: &str) -> Result<i32> {
        self.runtime.exec(self.require()?, command, workdir)
    }

    pub fn copy_out(&self, path: &str) -> Result<Vec<u8>> {
        self.runtime.copy_out(self.require()?, path)
    }

    /// Kill the running instance, if any. Safe to call repeatedly.
    pub fn release(&mut self) -> Result<()> {
        if let Some(id) = self.current.take() {
            info!(container = %id, "releasing environment");
            self.runtime.kill(&id)?;
        }
        Ok(())
    }

    fn require(&self) -> Result<&str> {
        self.current
            .as_deref()
            .ok_or_else(|| EvalError::Environment("no environment is running".to_string()))
    }
}

impl Drop for ManagedEnvironment {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to release environment");
        }
    }
}

impl std::fmt::Debug for ManagedEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedEnvironment")
            .field("current", &self.current)
            .finish()
    }
}
