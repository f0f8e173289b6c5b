use std::time::Duration;

use crate::cascade::Level;
use crate::config::*;

const SAMPLE: &str = r#"
apiVersion: apps/v1
metadata:
  name: edge
spec:
  listen: "0.0.0.0:8080"
  resources:
    orders:
      frontend: /api/orders/:id
      backend: http://orders.internal:9000
      method: GET
      use:
        cors: default
        cache:
          addr: jetstream://cache-host:4222/orders
          ttl: 30s
          key: "orders:{:id}:{?page}"
      filters:
        - name: auth
          addr: http://auth.internal/check
          level: request
          timeout: 500ms
          exchange:
            headers: [x-user]
        - name: audit
          addr: nats://bus:4222/audit.log
          level: response
          async: true
        - name: join
          addr: http://join.internal/
          level: response
          await: [audit]
"#;

#[test]
fn sample_config_parses() {
	let (metadata, spec) = parse(SAMPLE).unwrap();
	assert_eq!(metadata.name, "edge");
	assert_eq!(spec.listen, "0.0.0.0:8080");
	let resource = &spec.resources["orders"];
	assert_eq!(resource.frontend, "/api/orders/:id");
	assert_eq!(resource.method, "GET");
	assert_eq!(resource.filters.len(), 3);
	assert!(resource.uses.cors.is_some());
	let cache = resource.uses.cache.as_ref().unwrap();
	assert_eq!(cache.ttl, "30s");
	assert!(resource.filters[1].parallel);
	assert_eq!(resource.filters[2].awaits, vec!["audit"]);
}

#[test]
fn unsupported_api_version_is_rejected() {
	let err = parse("apiVersion: apps/v2\nspec: {listen: x}").unwrap_err();
	assert!(err.to_string().contains("unsupported version"));
}

#[test]
fn timeout_literals_parse_with_their_units() {
	assert_eq!(parse_timeout(Some("500ms")).unwrap(), Duration::from_millis(500));
	assert_eq!(parse_timeout(Some("30s")).unwrap(), Duration::from_secs(30));
	assert_eq!(parse_timeout(Some("2m")).unwrap(), Duration::from_secs(120));
	assert_eq!(parse_timeout(Some("1h")).unwrap(), Duration::from_secs(3600));
	// missing timeouts fall back to the default deadline
	assert_eq!(parse_timeout(None).unwrap(), Duration::from_secs(30));
	assert_eq!(parse_timeout(Some("")).unwrap(), Duration::from_secs(30));
	assert!(parse_timeout(Some("soon")).is_err());
}

#[test]
fn levels_parse_case_insensitively() {
	assert_eq!(parse_level("connect").unwrap(), Level::CONNECT);
	assert_eq!(parse_level("Request").unwrap(), Level::REQUEST);
	assert_eq!(parse_level("RESPONSE").unwrap(), Level::RESPONSE);
	assert!(parse_level("sideways").is_err());
}

#[test]
fn env_hosts_substitute_from_the_environment() {
	// PATH is always present; the value itself does not matter here
	let resolved = resolve_env_hosts("[[PATH]]").unwrap();
	assert_eq!(resolved, std::env::var("PATH").unwrap());
	assert!(resolve_env_hosts("nats://[[SURELY_NOT_SET_ANYWHERE]]:4222").is_err());
	assert!(resolve_env_hosts("nats://[[unterminated:4222").is_err());
	assert_eq!(resolve_env_hosts("nats://plain:4222").unwrap(), "nats://plain:4222");
}

#[test]
fn policy_entries_accept_strings_and_maps() {
	let yaml = r#"
apiVersion: apps/v1
spec:
  listen: x
  resources:
    r:
      frontend: /p
      backend: http://b
      use:
        opa:
          agent: nats://opa:4222/opa.eval
          http:
            - allow_all
            - restricted: local
"#;
	let (_, spec) = parse(yaml).unwrap();
	let opa = spec.resources["r"].uses.opa.as_ref().unwrap();
	assert_eq!(opa.http.len(), 2);
	assert!(matches!(opa.http[0], PolicyEntryV1::Name(ref n) if n == "allow_all"));
	assert!(matches!(opa.http[1], PolicyEntryV1::Typed(_)));
}

#[test]
fn custom_cors_values_survive_parsing() {
	let yaml = r#"
apiVersion: apps/v1
spec:
  listen: x
  resources:
    r:
      frontend: /p
      backend: http://b
      use:
        cors:
          origin: https://app.example.com
          maxAge: "60"
"#;
	let (_, spec) = parse(yaml).unwrap();
	match spec.resources["r"].uses.cors.as_ref().unwrap() {
		CorsUseV1::Custom(custom) => {
			assert_eq!(custom.origin.as_deref(), Some("https://app.example.com"));
			assert_eq!(custom.max_age.as_deref(), Some("60"));
		},
		CorsUseV1::Named(_) => panic!("expected a custom CORS block"),
	}
}
