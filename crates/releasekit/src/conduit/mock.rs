//! Scripted conduit for tests.
//!
//! Rules are matched against the script text by substring, first match wins.
//! Unmatched scripts succeed with empty output. Every call is recorded.

use super::{CommandOutput, Conduit, ExecOptions, HostRef};
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Canned reaction to a matching script.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Return this output
    Output(CommandOutput),
    /// Behave as if the timeout expired
    Timeout,
}

impl Reply {
    /// Successful reply with stdout.
    pub fn ok(stdout: &str) -> Self {
        Self::Output(CommandOutput::ok(stdout))
    }

    /// Failing reply with exit code and stderr.
    pub fn fail(code: i32, stderr: &str) -> Self {
        Self::Output(CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            status: code,
        })
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    queue: VecDeque<Reply>,
    last: Reply,
}

/// A recorded invocation.
#[derive(Debug, Clone)]
pub struct Call {
    /// Host label
    pub host: String,
    /// Script text without prelude
    pub script: String,
    /// Secret delivered on the side channel
    pub secret: Option<String>,
    /// Timeout requested
    pub timeout: Option<Duration>,
}

/// Test double for [`Conduit`].
#[derive(Debug, Default)]
pub struct ScriptedConduit {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedConduit {
    /// Empty conduit: every command succeeds with no output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to scripts containing `pattern` with stdout and exit 0.
    pub fn on(&self, pattern: &str, stdout: &str) -> &Self {
        self.on_seq(pattern, vec![Reply::ok(stdout)])
    }

    /// Reply to scripts containing `pattern` with a failure.
    pub fn on_fail(&self, pattern: &str, code: i32, stderr: &str) -> &Self {
        self.on_seq(pattern, vec![Reply::fail(code, stderr)])
    }

    /// Make scripts containing `pattern` time out.
    pub fn on_timeout(&self, pattern: &str) -> &Self {
        self.on_seq(pattern, vec![Reply::Timeout])
    }

    /// Successive replies; the last one repeats.
    pub fn on_seq(&self, pattern: &str, replies: Vec<Reply>) -> &Self {
        let mut queue: VecDeque<Reply> = replies.into();
        let last = queue.pop_back().unwrap_or_else(|| Reply::ok(""));
        locked(&self.rules).push(Rule {
            pattern: pattern.to_string(),
            queue,
            last,
        });
        self
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<Call> {
        locked(&self.calls).clone()
    }

    /// Scripts run so far.
    pub fn scripts(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.script).collect()
    }

    /// Whether any script contained `pattern`.
    pub fn ran(&self, pattern: &str) -> bool {
        self.count(pattern) > 0
    }

    /// Number of scripts that contained `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.scripts().iter().filter(|s| s.contains(pattern)).count()
    }

    /// Index of the first script containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.scripts().iter().position(|s| s.contains(pattern))
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Conduit for ScriptedConduit {
    fn execute(&self, host: &HostRef, script: &str, opts: &ExecOptions) -> Result<CommandOutput> {
        locked(&self.calls).push(Call {
            host: host.label().to_string(),
            script: script.to_string(),
            secret: opts.secret.as_ref().map(|s| s.expose().to_string()),
            timeout: opts.timeout,
        });

        let reply = {
            let mut rules = locked(&self.rules);
            match rules.iter_mut().find(|r| script.contains(&r.pattern)) {
                Some(rule) => rule.queue.pop_front().unwrap_or_else(|| rule.last.clone()),
                None => Reply::ok(""),
            }
        };

        match reply {
            Reply::Output(output) => Ok(output),
            Reply::Timeout => Err(Error::Timeout {
                host: host.label().to_string(),
                command: script.to_string(),
                timeout: opts.timeout.unwrap_or_default(),
            }),
        }
    }
}
