/// Logical coordinates of a dataset endpoint, resolved to physical names.
///
/// Datasets declared in a pipeline are pipeline-scoped: `my_dataset` in
/// pipeline `my_pipeline` lives on topic `my_pipeline.my_dataset`. A global
/// prefix applies to every topic and consumer identity: with prefix `test`
/// the same dataset maps to `test.my_pipeline.my_dataset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetAddress {
    pub dataset: String,
    pub pipeline: String,
    pub node: String,
    pub prefix: Option<String>,
    pub pipeline_prefixed: bool,
}

/// Result of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNames {
    /// Physical topic: `[prefix.][pipeline.]dataset`.
    pub topic_name: String,
    /// Consumer identity / group id: `[prefix.]pipeline.node`.
    pub identity: String,
}

impl DatasetAddress {
    pub fn new(
        dataset: impl Into<String>,
        pipeline: impl Into<String>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            pipeline: pipeline.into(),
            node: node.into(),
            prefix: None,
            pipeline_prefixed: false,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn pipeline_prefixed(mut self, yes: bool) -> Self {
        self.pipeline_prefixed = yes;
        self
    }

    pub fn resolve(&self) -> ResolvedNames {
        resolve(
            &self.dataset,
            &self.pipeline,
            &self.node,
            self.prefix.as_deref(),
            self.pipeline_prefixed,
        )
    }
}

/// Map logical names to the physical topic and the consumer identity.
///
/// An empty prefix counts as no prefix.
pub fn resolve(
    dataset: &str,
    pipeline: &str,
    node: &str,
    prefix: Option<&str>,
    pipeline_prefixed: bool,
) -> ResolvedNames {
    let prefix = prefix.filter(|p| !p.is_empty());

    let mut topic_name = dataset.to_string();
    if pipeline_prefixed {
        topic_name = format!("{pipeline}.{topic_name}");
    }

    let mut identity = format!("{pipeline}.{node}");
    if let Some(prefix) = prefix {
        topic_name = format!("{prefix}.{topic_name}");
        identity = format!("{prefix}.{identity}");
    }

    ResolvedNames {
        topic_name,
        identity,
    }
}
