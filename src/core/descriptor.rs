//! Serializable job descriptors.
//!
//! Descriptors are the submission format: tasks refer to their dependencies
//! and flow targets by name. Both TOML and JSON are accepted; the format is
//! picked from the file extension.

use crate::core::job::Job;
use crate::core::task::{ErrorPolicy, FlowBlock, FlowScript, Task};
use crate::error::Result;
use crate::flog_debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub on_task_error: Option<ErrorPolicy>,
    #[serde(default)]
    pub tasks: Vec<TaskDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    #[serde(default)]
    pub implementation: String,
    /// Read the implementation from a file, relative to the descriptor.
    #[serde(default)]
    pub implementation_file: Option<PathBuf>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub flow_block: FlowBlock,
    #[serde(default)]
    pub flow_script: Option<FlowScript>,
    #[serde(default)]
    pub selection_script: Option<String>,
    #[serde(default)]
    pub pre_script: Option<String>,
    #[serde(default)]
    pub post_script: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub precious_result: bool,
    #[serde(default)]
    pub on_error: Option<ErrorPolicy>,
}

impl JobDescriptor {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a descriptor from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        flog_debug!("JobDescriptor::load path={}", path.display());
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    /// Build the job graph. `base_dir` anchors relative implementation files.
    ///
    /// # Errors
    /// Propagates `DuplicateTaskName`, `UnknownTask` and `CycleDetected`
    /// from graph construction, and IO errors from implementation files.
    pub fn into_job(self, base_dir: Option<&Path>) -> Result<Job> {
        let mut job = Job::new(&self.name);
        job.variables = self.variables;
        job.on_task_error = self.on_task_error;

        let mut dependencies = Vec::new();
        for desc in self.tasks {
            let implementation = match &desc.implementation_file {
                Some(file) => {
                    let path = match base_dir {
                        Some(dir) if file.is_relative() => dir.join(file),
                        _ => file.clone(),
                    };
                    fs::read_to_string(&path)?
                }
                None => desc.implementation.clone(),
            };

            let mut task = Task::new(&desc.name, &implementation).with_flow_block(desc.flow_block);
            task.flow_script = desc.flow_script;
            task.selection_script = desc.selection_script;
            task.pre_script = desc.pre_script;
            task.post_script = desc.post_script;
            task.variables = desc.variables;
            task.precious_result = desc.precious_result;
            task.on_error = desc.on_error;
            job.add_task(task)?;

            for dep in desc.depends_on {
                dependencies.push((desc.name.clone(), dep));
            }
        }

        for (task, depends_on) in dependencies {
            job.add_dependency(&task, &depends_on)?;
        }

        Ok(job)
    }
}
