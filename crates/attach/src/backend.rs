use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sattach_common::{StepId, StepLayout, StepLayoutFile};

/// Resolves a job step to the nodes and tasks it runs on.
#[async_trait]
pub trait StepLayoutSource: Send + Sync {
    /// `Ok(None)` when the step does not exist or has already ended.
    async fn resolve_step_layout(&self, step: StepId) -> Result<Option<StepLayout>>;
}

/// Layouts known up front, typically loaded from a layout file.
#[derive(Debug, Clone, Default)]
pub struct StaticLayoutSource {
    layouts: HashMap<StepId, StepLayout>,
}

impl StaticLayoutSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let mut source = Self::new();
        for (step, layout) in StepLayoutFile::load(path)?.into_layouts()? {
            source.insert(step, layout);
        }
        Ok(source)
    }

    pub fn insert(&mut self, step: StepId, layout: StepLayout) {
        self.layouts.insert(step, layout);
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

#[async_trait]
impl StepLayoutSource for StaticLayoutSource {
    async fn resolve_step_layout(&self, step: StepId) -> Result<Option<StepLayout>> {
        Ok(self.layouts.get(&step).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn resolves_steps_from_layout_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.toml");
        fs::write(
            &path,
            r#"
[[step]]
job_id = 42
step_id = 1
node_list = "node[1-2]"
node_addrs = ["127.0.0.1:7001", "127.0.0.1:7002"]
tasks_per_node = [1, 2]
"#,
        )
        .unwrap();

        let source = StaticLayoutSource::from_file(&path).unwrap();
        assert_eq!(source.len(), 1);

        let layout = source
            .resolve_step_layout(StepId::new(42, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(layout.node_count(), 2);
        assert_eq!(layout.task_ids(1), &[1, 2]);

        assert!(source
            .resolve_step_layout(StepId::new(42, 0))
            .await
            .unwrap()
            .is_none());
    }
}
