//! Rendering of per-service configuration text.

use crate::desired::DesiredSnapshot;
use crate::error::RenderError;
use crate::service::ManagedService;

/// Renders the configuration file for a managed service.
pub trait ConfigRenderer: Send + Sync {
    fn render(&self, service: ManagedService, desired: &DesiredSnapshot) -> Result<String, RenderError>;
}

/// Renders the syslog-ng and logstash configurations from fixed templates.
#[derive(Debug, Default, Clone)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl ConfigRenderer for TemplateRenderer {
    fn render(&self, service: ManagedService, desired: &DesiredSnapshot) -> Result<String, RenderError> {
        match service {
            ManagedService::SyslogCollector => Ok(render_syslog(desired)),
            ManagedService::LogShipper => render_logstash(desired),
        }
    }
}

const SYSLOG_HEADER: &str = r#"@version: 4.7
@include "scl.conf"

source s_local {
	internal();
};

source s_network_firepower {
	syslog(transport("udp") port(514));
};

source s_network_ise {
	syslog(transport("udp") port(1025));
};
"#;

fn render_syslog(desired: &DesiredSnapshot) -> String {
    let collector = desired.endpoints.threat_collector_url.trim_end_matches('/');
    let secret = &desired.identity.auth_secret;
    let name = &desired.identity.name;

    let mut out = String::from(SYSLOG_HEADER);
    for stream in ["ise", "firepower"] {
        out.push_str(&format!(
            r#"
destination d_http_{stream} {{
	http(
		url("{collector}/{stream}")
		method("POST")
		headers("X-AUTH_KEY: {secret}")
		headers("X-AGGREGATOR_NAME: {name}")
		body("<$PRI>$YEAR-$MONTH-$DAYT$HOUR:$MIN:$SEC.$MSEC $HOST $PROGRAM: $MSG")
	);
}};
"#
        ));
    }
    for stream in ["ise", "firepower"] {
        out.push_str(&format!(
            r#"
log {{
	source(s_network_{stream});
	destination(d_http_{stream});
}};
"#
        ));
    }
    out
}

fn render_logstash(desired: &DesiredSnapshot) -> Result<String, RenderError> {
    let inputs: Vec<String> = desired
        .elasticsearch_targets
        .iter()
        .filter(|t| !t.url.is_empty() && !t.user.is_empty())
        .map(|t| {
            format!(
                r#"input {{
	elasticsearch {{
		hosts => "{url}"
		user => "{user}"
		password => "{password}"
		index => "logstash-*"
		query => '{{ "query": {{ "range": {{ "@timestamp": {{ "gt": "now-2s" }} }} }} }}'
		schedule => "*/2 * * * * *"
		docinfo => true
	}}
}}"#,
                url = t.url,
                user = t.user,
                password = t.password,
            )
        })
        .collect();

    if inputs.is_empty() {
        return Err(RenderError::NoTargets(ManagedService::LogShipper));
    }

    let output = format!(
        r#"output {{
	http {{
		url => "{collector}/t-pot"
		http_method => "post"
		format => "json"
		headers => {{
			"X-AUTH_KEY" => "{secret}"
			"X-AGGREGATOR_NAME" => "{name}"
		}}
	}}
}}
"#,
        collector = desired.endpoints.threat_collector_url.trim_end_matches('/'),
        secret = desired.identity.auth_secret,
        name = desired.identity.name,
    );

    Ok(format!("{}\n\n{}", inputs.join("\n\n"), output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElasticsearchTarget;
    use crate::desired::tests::test_config;
    use crate::desired::DesiredConfig;

    fn snapshot() -> DesiredSnapshot {
        let (desired, _rx) = DesiredConfig::new(&test_config());
        desired.snapshot()
    }

    #[test]
    fn test_syslog_routes_both_streams() {
        let text = TemplateRenderer::new()
            .render(ManagedService::SyslogCollector, &snapshot())
            .unwrap();
        assert!(text.contains(r#"url("https://threats.example.invalid/ise")"#));
        assert!(text.contains(r#"url("https://threats.example.invalid/firepower")"#));
        assert!(text.contains("X-AGGREGATOR_NAME: agg-test"));
        assert!(text.contains("destination(d_http_firepower);"));
    }

    #[test]
    fn test_logstash_skips_incomplete_targets() {
        let mut desired = snapshot();
        desired.elasticsearch_targets.push(ElasticsearchTarget {
            url: "https://es-anon:9200".to_string(),
            user: String::new(),
            password: String::new(),
        });

        let text = TemplateRenderer::new()
            .render(ManagedService::LogShipper, &desired)
            .unwrap();
        assert_eq!(text.matches("elasticsearch {").count(), 1);
        assert!(text.contains(r#"hosts => "https://es:9200""#));
        assert!(!text.contains("es-anon"));
        assert!(text.contains(r#"url => "https://threats.example.invalid/t-pot""#));
    }

    #[test]
    fn test_logstash_without_targets_fails() {
        let mut desired = snapshot();
        desired.elasticsearch_targets.clear();

        let err = TemplateRenderer::new()
            .render(ManagedService::LogShipper, &desired)
            .unwrap_err();
        assert!(matches!(err, RenderError::NoTargets(ManagedService::LogShipper)));
    }
}
