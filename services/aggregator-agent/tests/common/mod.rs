//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;

use aggregator_agent::Config;

pub const NAME: &str = "agg-1";
pub const SECRET: &str = "s3cret";

/// Build a config from defaults plus `overrides`.
pub fn config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("AGGREGATOR_NAME".to_string(), NAME.to_string()),
        ("AUTH_SECRET".to_string(), SECRET.to_string()),
        ("HEARTBEAT_IDENTIFIER".to_string(), "hb-1".to_string()),
        (
            "ELASTICSEARCH_TARGETS".to_string(),
            r#"[{"url":"https://es:9200","user":"elastic","pass":"pw"}]"#.to_string(),
        ),
    ]);
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
}
