//! # HTTP Probe Client
//!
//! Issues the authenticated HTTP calls described by an intent's `probes`
//! list, records per-probe status, and gates the reconciler on whether
//! every probe's condition is met. Probes run strictly in declared order
//! (§5): the Reconciler stops at the first unmet probe rather than firing
//! the rest, since a later probe's URL or body may legitimately depend on
//! an earlier one having already gated.

use chrono::Utc;
use kube::Client;
use reqwest::Client as HttpClient;
use std::time::Duration;
use tracing::{debug, warn};

use crate::constants::PROBE_RESPONSE_TRUNCATE_BYTES;
use crate::credentials::resolve_bearer_token;
use crate::observability::metrics;
use crate::policy;
use crate::{ProbeSpec, ProbeStatus};

/// Runs the declared probes for one reconciliation. Stateless beyond the
/// shared HTTP client; credentials are resolved per-probe since each may
/// reference a different secret.
#[derive(Debug, Clone)]
pub struct ProbeClient {
    http: HttpClient,
}

impl Default for ProbeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }

    /// Run all probes in order, stopping at (and including) the first one
    /// whose condition is not met. Returns the statuses produced so far
    /// and whether every probe that ran was satisfied.
    pub async fn run_all(
        &self,
        kube_client: &Client,
        default_namespace: &str,
        controller: &str,
        probes: &[ProbeSpec],
    ) -> (Vec<ProbeStatus>, bool) {
        let mut statuses = Vec::with_capacity(probes.len());
        let mut all_met = true;
        for probe in probes {
            let status = self
                .run_one(kube_client, default_namespace, controller, probe)
                .await;
            if !status.condition_met {
                all_met = false;
                statuses.push(status);
                break;
            }
            statuses.push(status);
        }
        (statuses, all_met)
    }

    async fn run_one(
        &self,
        kube_client: &Client,
        default_namespace: &str,
        controller: &str,
        probe: &ProbeSpec,
    ) -> ProbeStatus {
        let mut status = ProbeStatus {
            name: probe.name.clone(),
            call_count: 1,
            success_count: 0,
            last_call_time: Some(Utc::now().to_rfc3339()),
            last_status_code: None,
            last_response: None,
            last_error: None,
            condition_met: false,
            extracted_data: Vec::new(),
            formatted_output: None,
        };

        let method = match probe.method.parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(e) => {
                status.last_error = Some(format!("invalid method '{}': {e}", probe.method));
                return status;
            }
        };

        let mut builder = self
            .http
            .request(method, &probe.url)
            .timeout(Duration::from_secs(probe.timeout_seconds));

        for (name, value) in &probe.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &probe.body {
            builder = builder.body(body.clone());
        }
        if let Some(auth_ref) = &probe.auth_ref {
            match resolve_bearer_token(kube_client, default_namespace, auth_ref).await {
                Ok(token) => builder = builder.bearer_auth(token),
                Err(e) => {
                    status.last_error = Some(format!("resolving probe credential: {e}"));
                    return status;
                }
            }
        }

        let start = std::time::Instant::now();
        let response = builder.send().await;
        let elapsed = start.elapsed().as_secs_f64();
        metrics::observe_probe_duration(controller, &probe.url, probe.method.as_str(), elapsed);

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(probe = %probe.name, error = %e, "probe request failed");
                status.last_error = Some(e.to_string());
                metrics::increment_condition_checks(controller, false);
                return status;
            }
        };

        let status_code = response.status().as_u16();
        status.last_status_code = Some(status_code);
        metrics::increment_requests_total(
            controller,
            &probe.url,
            probe.method.as_str(),
            status_code,
        );

        let body_bytes = response.bytes().await.unwrap_or_default();
        metrics::observe_response_size(controller, &probe.url, body_bytes.len() as f64);

        let truncated = if body_bytes.len() > PROBE_RESPONSE_TRUNCATE_BYTES {
            String::from_utf8_lossy(&body_bytes[..PROBE_RESPONSE_TRUNCATE_BYTES]).into_owned()
        } else {
            String::from_utf8_lossy(&body_bytes).into_owned()
        };
        status.last_response = Some(truncated);

        let status_ok = if probe.expected_status_codes.is_empty() {
            status_code <= probe.max_status_code
        } else {
            probe.expected_status_codes.contains(&status_code)
        };

        if !status_ok {
            status.condition_met = false;
            metrics::increment_condition_checks(controller, false);
            return status;
        }
        status.success_count = 1;

        match &probe.response_parsing {
            None => {
                status.condition_met = true;
            }
            Some(policy) => {
                let json_body: serde_json::Value =
                    match serde_json::from_slice(&body_bytes) {
                        Ok(v) => v,
                        Err(e) => {
                            debug!(probe = %probe.name, error = %e, "probe body is not valid JSON");
                            metrics::increment_json_parsing_errors(controller, "invalid_json");
                            status.last_error = Some(format!("invalid JSON body: {e}"));
                            status.condition_met = false;
                            metrics::increment_condition_checks(controller, false);
                            return status;
                        }
                    };

                if let Some(path) = &policy.field_path {
                    match crate::policy::extract_by_path(&json_body, path) {
                        Ok(v) => {
                            status.condition_met = true;
                            status.extracted_data.push(match v {
                                serde_json::Value::String(s) => s,
                                other => other.to_string(),
                            });
                        }
                        Err(e) => {
                            metrics::increment_json_parsing_errors(controller, "path_not_found");
                            status.last_error = Some(e.to_string());
                            status.condition_met = false;
                        }
                    }
                } else {
                    let outcome = policy::evaluate(
                        policy.condition.as_deref(),
                        policy.data_expression.as_deref(),
                        policy.output_format.as_deref(),
                        &json_body,
                    );
                    status.condition_met = outcome.condition_met;
                    status.extracted_data = outcome.extracted;
                    status.formatted_output = Some(outcome.formatted);
                    if let Some(err) = outcome.error {
                        metrics::increment_json_parsing_errors(controller, "expression_error");
                        status.last_error = Some(err);
                    }
                }
            }
        }

        metrics::increment_condition_checks(controller, status.condition_met);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_responses() {
        let long = "x".repeat(PROBE_RESPONSE_TRUNCATE_BYTES + 500);
        let truncated = if long.len() > PROBE_RESPONSE_TRUNCATE_BYTES {
            &long[..PROBE_RESPONSE_TRUNCATE_BYTES]
        } else {
            &long
        };
        assert_eq!(truncated.len(), PROBE_RESPONSE_TRUNCATE_BYTES);
    }

    #[test]
    fn status_code_gate_without_expected_set_uses_max() {
        let probe = ProbeSpec {
            name: "p".to_string(),
            url: "http://example.invalid".to_string(),
            method: "GET".to_string(),
            headers: Default::default(),
            body: None,
            auth_ref: None,
            timeout_seconds: 30,
            expected_status_codes: vec![],
            max_status_code: 399,
            response_parsing: None,
        };
        assert!(probe.expected_status_codes.is_empty());
        assert_eq!(probe.max_status_code, 399);
    }
}
