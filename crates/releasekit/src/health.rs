//! Post-activation health verification.
//!
//! The verifier only reports. Whether an unhealthy release is rolled back is
//! decided by the caller from the returned [`VerifyResult`].

use crate::conduit::{Conduit, ExecOptions, HostRef};
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, poll_until};
use crate::shell::{in_dir, quote, quote_path};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

const SNIPPET_CHARS: usize = 500;

/// A command run inside the release whose output decides pass or fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeepProbe {
    /// Probe name shown in reports
    pub name: String,
    /// Command run inside the active release
    pub command: String,
    /// Output fragments that mark a failure
    pub failure_markers: Vec<String>,
    /// Whether a failure fails verification (otherwise only warns)
    #[serde(default = "default_true")]
    pub fatal: bool,
}

fn default_true() -> bool {
    true
}

impl DeepProbe {
    fn tinker(name: &str, code: &str, marker: &str, fatal: bool) -> Self {
        Self {
            name: name.to_string(),
            command: format!("php artisan tinker --execute={} 2>&1 || echo {marker}", quote(code)),
            failure_markers: vec![marker.to_string(), "Exception".to_string()],
            fatal,
        }
    }

    /// Database round-trip, cache round-trip and Redis ping probes.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::tinker("Database", "DB::select(\"SELECT 1\")", "DB_FAILED", true),
            Self::tinker("Redis", "Redis::ping()", "REDIS_FAILED", true),
            Self::tinker(
                "Cache",
                "Cache::put(\"stagehand_health\", \"ok\", 60); echo Cache::get(\"stagehand_health\") === \"ok\" ? \"CACHE_OK\" : \"CACHE_FAILED\";",
                "CACHE_FAILED",
                false,
            ),
        ]
    }
}

/// Verification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Verify after activation
    pub enabled: bool,
    /// Path appended to the application URL
    pub health_path: String,
    /// Status codes accepted as healthy
    pub valid_codes: Vec<u16>,
    /// Per-request timeout in seconds
    pub timeout: u64,
    /// Seconds to wait before the first attempt
    pub wait: u64,
    /// Attempts before giving up
    pub retries: u32,
    /// Seconds between attempts
    pub retry_delay: u64,
    /// Accept self-signed certificates
    pub insecure: bool,
    /// Search the body for error signatures
    pub check_body: bool,
    /// Case-insensitive substrings that mark a broken page
    pub error_patterns: Vec<String>,
    /// Run deep probes after the HTTP check passes
    pub deep: bool,
    /// Deep probes to run
    pub deep_probes: Vec<DeepProbe>,
    /// Roll back automatically when a deploy fails for other reasons
    pub auto_rollback: bool,
    /// Application log, relative to the deploy path
    pub log_file: String,
    /// Log lines shown after a failed verification
    pub log_lines: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_path: "/".to_string(),
            valid_codes: vec![200, 301, 302, 303, 307, 308],
            timeout: 15,
            wait: 2,
            retries: 10,
            retry_delay: 2,
            insecure: true,
            check_body: true,
            error_patterns: [
                "Fatal error:",
                "Parse error:",
                "syntax error,",
                "Uncaught Exception",
                "Stack trace:",
                "vendor/laravel/framework",
                "500 Internal Server Error",
                "503 Service Unavailable",
                "Whoops, looks like something went wrong",
                "The stream or file",
                "SQLSTATE[",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            deep: false,
            deep_probes: DeepProbe::defaults(),
            auto_rollback: true,
            log_file: "shared/storage/logs/laravel.log".to_string(),
            log_lines: 30,
        }
    }
}

impl VerifyConfig {
    /// Single attempt, no body inspection, no deep probes, no wait.
    #[must_use]
    pub fn quick(&self) -> Self {
        Self {
            retries: 1,
            wait: 0,
            check_body: false,
            deep: false,
            ..self.clone()
        }
    }
}

/// Join the application URL and the health path with exactly one slash.
pub fn check_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// First configured signature found in `body`, ignoring case.
pub fn find_error_signature<'p>(body: &str, patterns: &'p [String]) -> Option<&'p str> {
    let haystack = body.to_lowercase();
    patterns
        .iter()
        .find(|p| !p.is_empty() && haystack.contains(&p.to_lowercase()))
        .map(String::as_str)
}

fn snippet(body: &str) -> String {
    body.chars().take(SNIPPET_CHARS).collect()
}

/// A fetched response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Response body
    pub body: String,
}

/// Fetches a URL. Transport failures are errors; any status is a response.
pub trait HttpProbe: Send + Sync {
    /// GET `url`, following redirects.
    fn fetch(&self, url: &str) -> Result<HttpResponse>;
}

/// [`HttpProbe`] backed by a ureq agent.
pub struct UreqProbe {
    agent: ureq::Agent,
    body_limit: u64,
}

impl UreqProbe {
    /// Agent with a global timeout, optionally skipping certificate checks.
    pub fn new(timeout: Duration, insecure: bool) -> Self {
        let tls = ureq::tls::TlsConfig::builder()
            .disable_verification(insecure)
            .build();
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .tls_config(tls)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            body_limit: 2 * 1024 * 1024,
        }
    }

    /// Probe configured from verification settings.
    pub fn from_config(config: &VerifyConfig) -> Self {
        Self::new(Duration::from_secs(config.timeout), config.insecure)
    }
}

impl HttpProbe for UreqProbe {
    fn fetch(&self, url: &str) -> Result<HttpResponse> {
        let mut response = self.agent.get(url).call().map_err(|e| Error::Http {
            message: e.to_string(),
        })?;
        let status = response.status().as_u16();
        let body = match response
            .body_mut()
            .with_config()
            .limit(self.body_limit)
            .read_to_vec()
        {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                log::debug!("could not read body of {url}: {e}");
                String::new()
            }
        };
        Ok(HttpResponse { status, body })
    }
}

/// One HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckResult {
    /// 1-based attempt number
    pub attempt: u32,
    /// Status code, `None` when no response arrived
    pub status: Option<u16>,
    /// Start of the body, or the transport error
    pub body: String,
    /// Whether the attempt passed
    pub passed: bool,
    /// Why the attempt failed
    pub reason: Option<String>,
}

/// Outcome of a deep probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Probe name
    pub name: String,
    /// Whether it passed
    pub passed: bool,
    /// Whether a failure is fatal
    pub fatal: bool,
    /// Probe output
    pub output: String,
}

/// Outcome of a verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    /// URL that was probed
    pub url: String,
    /// Whether some attempt passed
    pub passed: bool,
    /// Every attempt, in order
    pub attempts: Vec<HealthCheckResult>,
    /// Deep probe outcomes
    pub probes: Vec<ProbeResult>,
}

impl VerifyResult {
    /// The final attempt.
    pub fn last(&self) -> Option<&HealthCheckResult> {
        self.attempts.last()
    }

    /// Verification error carrying the last attempt's diagnostics.
    pub fn to_error(&self) -> Error {
        let last = self.last();
        Error::Verification {
            url: self.url.clone(),
            attempts: u32::try_from(self.attempts.len()).unwrap_or(u32::MAX),
            status: last.and_then(|a| a.status),
            body: last.map(|a| a.body.clone()).unwrap_or_default(),
        }
    }
}

/// Probes an application URL and optionally its backing services.
pub struct HealthVerifier<'a> {
    probe: &'a dyn HttpProbe,
    config: &'a VerifyConfig,
    remote: Option<(&'a dyn Conduit, &'a HostRef)>,
}

impl<'a> HealthVerifier<'a> {
    /// Create a verifier. Deep probes need [`HealthVerifier::with_remote`].
    pub fn new(probe: &'a dyn HttpProbe, config: &'a VerifyConfig) -> Self {
        Self {
            probe,
            config,
            remote: None,
        }
    }

    /// Host on which deep probes run.
    #[must_use]
    pub fn with_remote(mut self, conduit: &'a dyn Conduit, host: &'a HostRef) -> Self {
        self.remote = Some((conduit, host));
        self
    }

    /// Settings in use.
    pub fn config(&self) -> &VerifyConfig {
        self.config
    }

    fn attempt(&self, url: &str, attempt: u32) -> HealthCheckResult {
        let response = match self.probe.fetch(url) {
            Ok(response) => response,
            Err(e) => {
                return HealthCheckResult {
                    attempt,
                    status: None,
                    body: e.to_string(),
                    passed: false,
                    reason: Some("no response".to_string()),
                };
            }
        };

        let reason = if !self.config.valid_codes.contains(&response.status) {
            Some(format!("unexpected status {}", response.status))
        } else if self.config.check_body {
            find_error_signature(&response.body, &self.config.error_patterns)
                .map(|sig| format!("error signature '{sig}' in body"))
        } else {
            None
        };

        HealthCheckResult {
            attempt,
            status: Some(response.status),
            body: snippet(&response.body),
            passed: reason.is_none(),
            reason,
        }
    }

    /// HTTP check only: retry until an attempt passes or the budget runs out.
    pub fn verify(&self, url: &str) -> VerifyResult {
        let schedule = RetryConfig::fixed(
            self.config.retries,
            Duration::from_secs(self.config.retry_delay),
        );
        let mut attempts: Vec<HealthCheckResult> = Vec::new();
        let outcome = poll_until(&schedule, || {
            let n = u32::try_from(attempts.len()).unwrap_or(u32::MAX) + 1;
            let result = self.attempt(url, n);
            match &result.reason {
                None => log::info!("health check passed (HTTP {})", result.status.unwrap_or(0)),
                Some(reason) => log::warn!(
                    "health check attempt {n}/{}: {reason}",
                    schedule.max_attempts
                ),
            }
            let passed = result.passed;
            attempts.push(result);
            Ok(passed)
        });

        VerifyResult {
            url: url.to_string(),
            passed: matches!(outcome, Ok(true)),
            attempts,
            probes: Vec::new(),
        }
    }

    /// Full verification of a deployed application.
    ///
    /// Waits, runs the HTTP check against `base_url` plus the health path,
    /// then runs deep probes from `app_dir` when enabled and the HTTP check
    /// passed. A fatal probe failure is returned as [`Error::DeepCheck`].
    pub fn run(&self, base_url: &str, app_dir: &str) -> Result<VerifyResult> {
        if self.config.wait > 0 {
            log::info!("waiting {}s for services to stabilize", self.config.wait);
            thread::sleep(Duration::from_secs(self.config.wait));
        }

        let url = check_url(base_url, &self.config.health_path);
        let mut result = self.verify(&url);
        if !result.passed || !self.config.deep {
            return Ok(result);
        }

        let Some((conduit, host)) = self.remote else {
            log::warn!("deep health checks requested without a host, skipping");
            return Ok(result);
        };
        result.probes = run_deep_probes(conduit, host, &self.config.deep_probes, app_dir)?;
        Ok(result)
    }
}

/// Run deep probes inside `app_dir`. Non-fatal failures only warn.
pub fn run_deep_probes(
    conduit: &dyn Conduit,
    host: &HostRef,
    probes: &[DeepProbe],
    app_dir: &str,
) -> Result<Vec<ProbeResult>> {
    let mut results = Vec::with_capacity(probes.len());
    for probe in probes {
        let output = conduit
            .execute(
                host,
                &in_dir(app_dir, &probe.command),
                &ExecOptions::with_timeout(Duration::from_secs(60)),
            )?
            .text()
            .to_string();
        let failed = probe
            .failure_markers
            .iter()
            .any(|m| output.contains(m.as_str()));

        if failed && probe.fatal {
            return Err(Error::DeepCheck {
                probe: probe.name.clone(),
                message: snippet(&output),
            });
        }
        if failed {
            log::warn!("{} check failed (non-fatal): {}", probe.name, snippet(&output));
        } else {
            log::info!("{} check passed", probe.name);
        }
        results.push(ProbeResult {
            name: probe.name.clone(),
            passed: !failed,
            fatal: probe.fatal,
            output,
        });
    }
    Ok(results)
}

/// Last lines of a log file on the host, if readable.
pub fn tail_log(conduit: &dyn Conduit, host: &HostRef, path: &str, lines: usize) -> Option<String> {
    let out = conduit
        .run(
            host,
            &format!("tail -n {lines} {} 2>/dev/null || true", quote_path(path)),
            &ExecOptions::with_timeout(Duration::from_secs(30)),
        )
        .ok()?;
    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::mock::ScriptedConduit;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses; the last one repeats.
    struct CannedProbe {
        replies: Mutex<VecDeque<Option<(u16, &'static str)>>>,
        urls: Mutex<Vec<String>>,
    }

    impl CannedProbe {
        fn new(replies: Vec<Option<(u16, &'static str)>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                urls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.urls.lock().unwrap().len()
        }
    }

    impl HttpProbe for CannedProbe {
        fn fetch(&self, url: &str) -> Result<HttpResponse> {
            self.urls.lock().unwrap().push(url.to_string());
            let mut replies = self.replies.lock().unwrap();
            let reply = if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                *replies.front().unwrap()
            };
            match reply {
                Some((status, body)) => Ok(HttpResponse {
                    status,
                    body: body.to_string(),
                }),
                None => Err(Error::Http {
                    message: "connection refused".into(),
                }),
            }
        }
    }

    fn fast() -> VerifyConfig {
        VerifyConfig {
            retries: 3,
            retry_delay: 0,
            wait: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_check_url() {
        assert_eq!(check_url("https://shop.test/", "/health"), "https://shop.test/health");
        assert_eq!(check_url("https://shop.test", "up"), "https://shop.test/up");
        assert_eq!(check_url("https://shop.test", "/"), "https://shop.test/");
    }

    #[test]
    fn test_signature_match_ignores_case() {
        let patterns = VerifyConfig::default().error_patterns;
        assert_eq!(
            find_error_signature("<b>FATAL ERROR:</b> oops", &patterns),
            Some("Fatal error:")
        );
        assert_eq!(find_error_signature("<h1>Welcome</h1>", &patterns), None);
    }

    #[test]
    fn test_first_pass_stops_immediately() {
        let probe = CannedProbe::new(vec![Some((200, "ok"))]);
        let config = fast();
        let result = HealthVerifier::new(&probe, &config).verify("https://shop.test/");
        assert!(result.passed);
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(probe.calls(), 1);
    }

    #[test]
    fn test_200_with_fatal_error_body_fails_attempt() {
        let probe = CannedProbe::new(vec![
            Some((200, "PHP Fatal error: Allowed memory size exhausted")),
            Some((200, "<html>fine</html>")),
        ]);
        let config = fast();
        let result = HealthVerifier::new(&probe, &config).verify("https://shop.test/");
        assert!(result.passed);
        assert_eq!(result.attempts.len(), 2);
        assert!(!result.attempts[0].passed);
        assert!(result.attempts[0].reason.as_deref().unwrap().contains("Fatal error:"));
    }

    #[test]
    fn test_body_ignored_when_check_disabled() {
        let probe = CannedProbe::new(vec![Some((200, "Stack trace: #0"))]);
        let config = VerifyConfig {
            check_body: false,
            ..fast()
        };
        assert!(HealthVerifier::new(&probe, &config).verify("https://shop.test/").passed);
    }

    #[test]
    fn test_exhausted_budget_reports_last_attempt() {
        let probe = CannedProbe::new(vec![
            None,
            Some((500, "500 Internal Server Error")),
            Some((502, "Bad Gateway")),
        ]);
        let config = fast();
        let result = HealthVerifier::new(&probe, &config).verify("https://shop.test/");
        assert!(!result.passed);
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.attempts[0].status, None);
        assert_eq!(result.last().unwrap().status, Some(502));

        match result.to_error() {
            Error::Verification {
                attempts, status, body, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(status, Some(502));
                assert_eq!(body, "Bad Gateway");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_response_shows_000() {
        let probe = CannedProbe::new(vec![None]);
        let config = fast().quick();
        let result = HealthVerifier::new(&probe, &config).verify("https://shop.test/");
        assert_eq!(result.attempts.len(), 1);
        assert!(result.to_error().to_string().contains("HTTP 000"));
    }

    #[test]
    fn test_quick_config() {
        let quick = VerifyConfig::default().quick();
        assert_eq!(quick.retries, 1);
        assert!(!quick.check_body);
        assert!(!quick.deep);
        assert_eq!(quick.wait, 0);
    }

    #[test]
    fn test_deep_database_failure_is_fatal() {
        let probe = CannedProbe::new(vec![Some((200, "ok"))]);
        let config = VerifyConfig {
            deep: true,
            ..fast()
        };
        let conduit = ScriptedConduit::new();
        conduit.on("DB::select", "DB_FAILED");
        let host = HostRef::Local;
        let err = HealthVerifier::new(&probe, &config)
            .with_remote(&conduit, &host)
            .run("https://shop.test", "/srv/shop/current")
            .unwrap_err();
        assert!(matches!(err, Error::DeepCheck { ref probe, .. } if probe == "Database"));
    }

    #[test]
    fn test_deep_cache_failure_only_warns() {
        let probe = CannedProbe::new(vec![Some((200, "ok"))]);
        let config = VerifyConfig {
            deep: true,
            ..fast()
        };
        let conduit = ScriptedConduit::new();
        conduit.on("Cache::put", "CACHE_FAILED");
        let host = HostRef::Local;
        let result = HealthVerifier::new(&probe, &config)
            .with_remote(&conduit, &host)
            .run("https://shop.test", "/srv/shop/current")
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.probes.len(), 3);
        assert!(!result.probes[2].passed);
        assert!(conduit.ran("cd /srv/shop/current && php artisan tinker"));
    }

    #[test]
    fn test_deep_probes_skipped_when_http_fails() {
        let probe = CannedProbe::new(vec![Some((503, "down"))]);
        let config = VerifyConfig {
            deep: true,
            retries: 1,
            ..fast()
        };
        let conduit = ScriptedConduit::new();
        let host = HostRef::Local;
        let result = HealthVerifier::new(&probe, &config)
            .with_remote(&conduit, &host)
            .run("https://shop.test", "/srv/shop/current")
            .unwrap();
        assert!(!result.passed);
        assert!(conduit.calls().is_empty());
    }

    #[test]
    fn test_tail_log_is_best_effort() {
        let conduit = ScriptedConduit::new();
        let host = HostRef::Local;
        assert_eq!(tail_log(&conduit, &host, "/srv/shop/shared/storage/logs/laravel.log", 30), None);
        conduit.on("tail -n 30", "[2026-03-14] production.ERROR: boom");
        assert!(tail_log(&conduit, &host, "/srv/shop/shared/storage/logs/laravel.log", 30)
            .unwrap()
            .contains("boom"));
    }
}
