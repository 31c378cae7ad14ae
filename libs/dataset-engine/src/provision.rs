use std::collections::BTreeMap;

use dataset_api::broker::{BrokerAdmin, NewTopic};
use dataset_api::config::render_param;
use dataset_api::{DatasetConfig, DatasetError, KafkaConfig};

const ALREADY_EXISTS: &str = "TOPIC_ALREADY_EXISTS";

/// Create the topics backing a pipeline's datasets.
///
/// `user_dataset_prefix` renames declared datasets to `<user_prefix>.<name>`;
/// `prefix` is the topic namespace prepended to those names. The logging
/// dataset is always created, unprefixed. Topics that already exist count
/// as created.
///
/// Returns the physical topic names, logging dataset last.
pub fn provision_datasets(
    admin: &dyn BrokerAdmin,
    config: &KafkaConfig,
    datasets: &BTreeMap<String, DatasetConfig>,
    prefix: Option<&str>,
    user_dataset_prefix: Option<&str>,
) -> Result<Vec<String>, DatasetError> {
    let prefix = prefix.filter(|p| !p.is_empty());
    let user_dataset_prefix = user_dataset_prefix.filter(|p| !p.is_empty());

    let named: Vec<(String, &DatasetConfig)> = datasets
        .iter()
        .map(|(name, cfg)| match user_dataset_prefix {
            Some(user) => (format!("{user}.{name}"), cfg),
            None => (name.clone(), cfg),
        })
        .collect();

    if let Some((name, _)) = named
        .iter()
        .find(|(name, _)| config.reserved_datasets.contains(name))
    {
        return Err(DatasetError::ReservedDataset(name.clone()));
    }

    let mut topics = Vec::with_capacity(named.len() + 1);
    for (name, dataset_config) in &named {
        let topic_name = match prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.clone(),
        };
        tracing::info!(dataset = %name, topic = %topic_name, "creating dataset");
        topics.push(new_topic(config, topic_name, dataset_config)?);
    }

    tracing::info!(dataset = %config.logging_dataset, "creating logging dataset");
    topics.push(new_topic(config, config.logging_dataset.clone(), &DatasetConfig::default())?);

    let mut created = Vec::with_capacity(topics.len());
    for (topic, result) in topics.iter().zip(admin.create_topics(&topics)) {
        match result {
            Ok(name) => created.push(name),
            Err(e) if e.code() == ALREADY_EXISTS => {
                tracing::warn!(topic = %topic.name, "topic already exists, skipping");
                created.push(topic.name.clone());
            }
            Err(e) => return Err(e.with_context(format!("creating topic '{}'", topic.name)).into()),
        }
    }
    Ok(created)
}

/// Topic defaults overridden by the dataset's params.
fn new_topic(
    config: &KafkaConfig,
    name: String,
    dataset_config: &DatasetConfig,
) -> Result<NewTopic, DatasetError> {
    let defaults = &config.topic_defaults;
    let params = &dataset_config.params;

    let mut topic_config = defaults.config.clone();
    if let Some(value) = params.get("config") {
        let table = value.as_table().ok_or_else(|| {
            DatasetError::Config(format!("dataset '{name}': `config` must be a table"))
        })?;
        for (k, v) in table {
            topic_config.insert(k.clone(), render_param(v));
        }
    }

    Ok(NewTopic {
        num_partitions: int_param(params, "num_partitions", &name)?.unwrap_or(defaults.num_partitions),
        replication_factor: int_param(params, "replication_factor", &name)?
            .unwrap_or(defaults.replication_factor),
        config: topic_config,
        name,
    })
}

fn int_param(
    params: &BTreeMap<String, toml::Value>,
    key: &str,
    dataset: &str,
) -> Result<Option<i32>, DatasetError> {
    let Some(value) = params.get(key) else {
        return Ok(None);
    };
    value
        .as_integer()
        .and_then(|v| i32::try_from(v).ok())
        .map(Some)
        .ok_or_else(|| DatasetError::Config(format!("dataset '{dataset}': `{key}` must be an integer")))
}
