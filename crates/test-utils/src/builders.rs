#![allow(dead_code)]

use std::collections::BTreeMap;

use taskrig::config::{
    BuildFile, CommandConfig, GenerateConfig, HealthcheckConfig, SelectorConfig, ServiceConfig,
    TaskConfig,
};
use taskrig::types::CacheMode;

/// Builder for `BuildFile` to simplify test setup.
#[derive(Default)]
pub struct BuildFileBuilder {
    file: BuildFile,
}

impl BuildFileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.file.tasks.insert(name.to_string(), task);
        self
    }

    pub fn with_service(mut self, name: &str, service: ServiceConfig) -> Self {
        self.file.services.insert(name.to_string(), service);
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.file.envs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_include(mut self, alias: &str, path: &str) -> Self {
        self.file.includes.insert(alias.to_string(), path.to_string());
        self
    }

    pub fn with_reference(mut self, alias: &str, path: &str) -> Self {
        self.file.references.insert(alias.to_string(), path.to_string());
        self
    }

    pub fn build(self) -> BuildFile {
        self.file
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    /// A task running a single command.
    pub fn new(cmd: &str) -> Self {
        Self {
            task: TaskConfig {
                cmds: vec![CommandConfig::Plain(cmd.to_string())],
                ..TaskConfig::default()
            },
        }
    }

    /// A task without commands (only useful with deps or `extend`).
    pub fn empty() -> Self {
        Self {
            task: TaskConfig::default(),
        }
    }

    pub fn cmd(mut self, cmd: &str) -> Self {
        self.task.cmds.push(CommandConfig::Plain(cmd.to_string()));
        self
    }

    pub fn cmd_in(mut self, cmd: &str, path: &str) -> Self {
        self.task.cmds.push(CommandConfig::Detailed {
            cmd: cmd.to_string(),
            path: Some(path.to_string()),
        });
        self
    }

    pub fn dep(mut self, name: &str) -> Self {
        self.task.deps.push(name.to_string());
        self
    }

    pub fn need(mut self, name: &str) -> Self {
        self.task.needs.push(name.to_string());
        self
    }

    pub fn src(mut self, pattern: &str) -> Self {
        self.task.src.push(pattern.to_string());
        self
    }

    pub fn generates(mut self, path: &str) -> Self {
        self.task.generates.push(GenerateConfig::Path(path.to_string()));
        self
    }

    pub fn generates_file(mut self, path: &str) -> Self {
        self.task.generates.push(GenerateConfig::Detailed {
            path: path.to_string(),
            file: Some(true),
        });
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.task.envs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.task.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn cache(mut self, mode: CacheMode) -> Self {
        self.task.cache = Some(mode);
        self
    }

    pub fn extend(mut self, base: &str) -> Self {
        self.task.extend = Some(base.to_string());
        self
    }

    pub fn image(mut self, image: &str) -> Self {
        self.task.image = Some(image.to_string());
        self
    }

    pub fn mount(mut self, mount: &str) -> Self {
        self.task.mounts.push(mount.to_string());
        self
    }

    pub fn volume(mut self, volume: &str) -> Self {
        self.task.volumes.push(volume.to_string());
        self
    }

    pub fn port(mut self, port: &str) -> Self {
        self.task.ports.push(port.to_string());
        self
    }

    pub fn shell(mut self, shell: &str) -> Self {
        self.task.shell = Some(shell.to_string());
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.task.description = Some(text.to_string());
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// Builder for `ServiceConfig`.
pub struct ServiceConfigBuilder {
    service: ServiceConfig,
}

impl ServiceConfigBuilder {
    /// A container service.
    pub fn image(image: &str) -> Self {
        Self {
            service: ServiceConfig {
                image: Some(image.to_string()),
                ..ServiceConfig::default()
            },
        }
    }

    /// A kubernetes port-forward service.
    pub fn kubernetes(context: &str, kind: &str, name: &str) -> Self {
        Self {
            service: ServiceConfig {
                context: Some(context.to_string()),
                selector: Some(SelectorConfig {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }),
                ..ServiceConfig::default()
            },
        }
    }

    pub fn port(mut self, port: &str) -> Self {
        self.service.ports.push(port.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.service.envs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn dep(mut self, name: &str) -> Self {
        self.service.deps.push(name.to_string());
        self
    }

    pub fn need(mut self, name: &str) -> Self {
        self.service.needs.push(name.to_string());
        self
    }

    pub fn healthcheck(mut self, cmd: &str, retries: Option<u32>) -> Self {
        self.service.healthcheck = Some(HealthcheckConfig {
            cmd: cmd.to_string(),
            interval: Some("10ms".to_string()),
            timeout: Some("1s".to_string()),
            retries,
        });
        self
    }

    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.service.labels = labels;
        self
    }

    pub fn build(self) -> ServiceConfig {
        self.service
    }
}
