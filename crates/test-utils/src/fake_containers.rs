use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use taskrig::container::{ContainerInfo, ContainerRuntime, CreateSpec, ExecSpec};
use taskrig::engine::StatusSink;
use taskrig::errors::ContainerError;
use taskrig::types::LogStream;

#[derive(Debug, Default)]
struct State {
    images: HashSet<String>,
    created: Vec<CreateSpec>,
    execs: Vec<(String, ExecSpec)>,
    removed: Vec<String>,
    pulled: Vec<String>,
    running: HashMap<String, bool>,
}

/// In-memory container runtime.
///
/// Containers get ids `c1`, `c2`, ... Every exec exits 0 unless its last
/// argument contains a scripted substring. Exec output is the command
/// itself, echoed to the sink.
#[derive(Debug, Default)]
pub struct FakeContainerRuntime {
    state: Mutex<State>,
    exit_codes: Vec<(String, i64)>,
    hangs: Vec<String>,
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `image` is present locally.
    pub fn with_image(self, image: &str) -> Self {
        self.state.lock().unwrap().images.insert(image.to_string());
        self
    }

    /// Commands containing `needle` exit with `code`.
    pub fn exit_code(mut self, needle: &str, code: i64) -> Self {
        self.exit_codes.push((needle.to_string(), code));
        self
    }

    /// Commands containing `needle` never finish.
    pub fn hangs_on(mut self, needle: &str) -> Self {
        self.hangs.push(needle.to_string());
        self
    }

    pub fn created(&self) -> Vec<CreateSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn execs(&self) -> Vec<(String, ExecSpec)> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state.lock().unwrap().pulled.clone()
    }

    /// Simulate the container exiting on its own.
    pub fn stop_container(&self, id: &str) {
        self.state.lock().unwrap().running.insert(id.to_string(), false);
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn list_images(&self) -> Result<Vec<String>, ContainerError> {
        Ok(self.state.lock().unwrap().images.iter().cloned().collect())
    }

    async fn pull_image(&self, image: &str, _platform: Option<&str>) -> Result<(), ContainerError> {
        let mut state = self.state.lock().unwrap();
        state.pulled.push(image.to_string());
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, ContainerError> {
        let mut state = self.state.lock().unwrap();
        state.created.push(spec.clone());
        Ok(format!("c{}", state.created.len()))
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        self.state.lock().unwrap().running.insert(id.to_string(), true);
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        spec: &ExecSpec,
        sink: &StatusSink,
    ) -> Result<i64, ContainerError> {
        let line = spec.cmd.last().cloned().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .execs
            .push((id.to_string(), spec.clone()));

        if self.hangs.iter().any(|needle| line.contains(needle.as_str())) {
            sink.line(LogStream::Stdout, line).await;
            return std::future::pending().await;
        }

        let code = self
            .exit_codes
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        sink.line(LogStream::Stdout, line).await;
        Ok(code)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, ContainerError> {
        let running = self
            .state
            .lock()
            .unwrap()
            .running
            .get(id)
            .copied()
            .unwrap_or(false);
        Ok(ContainerInfo {
            running,
            exit_code: if running { 0 } else { 1 },
        })
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        let mut state = self.state.lock().unwrap();
        state.removed.push(id.to_string());
        state.running.remove(id);
        Ok(())
    }
}
