//! Checks over the MCP calls an agent made during a task.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::mcp::{CallHistory, CallRecord};

/// Identifies tools on one MCP server: an exact name, a regex, or (when
/// neither is set) any tool of the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAssertion {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_pattern: Option<String>,
}

impl ToolAssertion {
    fn matcher(&self) -> ConfigResult<ToolMatcher<'_>> {
        let pattern = match &self.tool_pattern {
            Some(p) => Some(Regex::new(p).map_err(|e| {
                ConfigError::Invalid(format!("invalid toolPattern {:?}: {}", p, e))
            })?),
            None => None,
        };
        Ok(ToolMatcher {
            assertion: self,
            pattern,
        })
    }

    fn describe(&self) -> String {
        match (&self.tool, &self.tool_pattern) {
            (Some(tool), _) => format!("{}/{}", self.server, tool),
            (None, Some(pattern)) => format!("{}/~{}", self.server, pattern),
            (None, None) => format!("{}/*", self.server),
        }
    }
}

struct ToolMatcher<'a> {
    assertion: &'a ToolAssertion,
    pattern: Option<Regex>,
}

impl ToolMatcher<'_> {
    fn matches(&self, call: &CallRecord) -> bool {
        if call.server != self.assertion.server {
            return false;
        }
        if let Some(tool) = &self.assertion.tool {
            return &call.name == tool;
        }
        match &self.pattern {
            Some(re) => re.is_match(&call.name),
            None => true,
        }
    }
}

/// Assertions configured on a task set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssertions {
    /// Every entry must be called at least once.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<ToolAssertion>,
    /// At least one entry must be called.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require_any: Vec<ToolAssertion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_not_used: Vec<ToolAssertion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tool_calls: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<usize>,
    /// Entries must be called in this order. Other calls may come in
    /// between.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub call_order: Vec<ToolAssertion>,
    #[serde(default)]
    pub no_duplicate_calls: bool,
}

/// Outcome of one assertion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl AssertionResult {
    fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
            details: Vec::new(),
        }
    }

    fn fail(reason: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
            details,
        }
    }
}

/// One optional result per kind of assertion. Unset fields were not
/// configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeAssertionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_used: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_any: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_not_used: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tool_calls: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_order: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_duplicate_calls: Option<AssertionResult>,
}

impl CompositeAssertionResult {
    /// The configured results, named as in the task set config.
    pub fn named_results(&self) -> Vec<(&'static str, &AssertionResult)> {
        [
            ("toolsUsed", &self.tools_used),
            ("requireAny", &self.require_any),
            ("toolsNotUsed", &self.tools_not_used),
            ("minToolCalls", &self.min_tool_calls),
            ("maxToolCalls", &self.max_tool_calls),
            ("callOrder", &self.call_order),
            ("noDuplicateCalls", &self.no_duplicate_calls),
        ]
        .into_iter()
        .filter_map(|(name, result)| result.as_ref().map(|r| (name, r)))
        .collect()
    }

    pub fn succeeded(&self) -> bool {
        self.named_results().iter().all(|(_, r)| r.passed)
    }
}

impl TaskAssertions {
    /// Checks that every tool pattern compiles.
    pub fn validate(&self) -> ConfigResult<()> {
        self.tools_used
            .iter()
            .chain(&self.require_any)
            .chain(&self.tools_not_used)
            .chain(&self.call_order)
            .try_for_each(|a| a.matcher().map(|_| ()))
    }

    pub fn evaluate(&self, history: &CallHistory) -> CompositeAssertionResult {
        let calls = &history.tool_calls;
        let mut out = CompositeAssertionResult::default();

        if !self.tools_used.is_empty() {
            out.tools_used = Some(with_matchers(&self.tools_used, |matchers| {
                let missing: Vec<String> = matchers
                    .iter()
                    .filter(|m| !calls.iter().any(|c| m.matches(c)))
                    .map(|m| format!("{} was not called", m.assertion.describe()))
                    .collect();
                if missing.is_empty() {
                    AssertionResult::pass(format!("all {} required tools were called", matchers.len()))
                } else {
                    AssertionResult::fail("required tools were not called", missing)
                }
            }));
        }

        if !self.require_any.is_empty() {
            out.require_any = Some(with_matchers(&self.require_any, |matchers| {
                match matchers
                    .iter()
                    .find(|m| calls.iter().any(|c| m.matches(c)))
                {
                    Some(m) => AssertionResult::pass(format!("{} was called", m.assertion.describe())),
                    None => AssertionResult::fail(
                        "none of the required tools were called",
                        matchers.iter().map(|m| m.assertion.describe()).collect(),
                    ),
                }
            }));
        }

        if !self.tools_not_used.is_empty() {
            out.tools_not_used = Some(with_matchers(&self.tools_not_used, |matchers| {
                let used: Vec<String> = calls
                    .iter()
                    .filter(|c| matchers.iter().any(|m| m.matches(c)))
                    .map(|c| format!("{}/{} was called", c.server, c.name))
                    .collect();
                if used.is_empty() {
                    AssertionResult::pass("no forbidden tools were called")
                } else {
                    AssertionResult::fail("forbidden tools were called", used)
                }
            }));
        }

        if let Some(min) = self.min_tool_calls {
            out.min_tool_calls = Some(if calls.len() >= min {
                AssertionResult::pass(format!("{} tool calls (min {})", calls.len(), min))
            } else {
                AssertionResult::fail(
                    format!("expected at least {} tool calls, got {}", min, calls.len()),
                    Vec::new(),
                )
            });
        }

        if let Some(max) = self.max_tool_calls {
            out.max_tool_calls = Some(if calls.len() <= max {
                AssertionResult::pass(format!("{} tool calls (max {})", calls.len(), max))
            } else {
                AssertionResult::fail(
                    format!("expected at most {} tool calls, got {}", max, calls.len()),
                    Vec::new(),
                )
            });
        }

        if !self.call_order.is_empty() {
            out.call_order = Some(with_matchers(&self.call_order, |matchers| {
                let mut next = 0;
                for call in calls {
                    if next < matchers.len() && matchers[next].matches(call) {
                        next += 1;
                    }
                }
                if next == matchers.len() {
                    AssertionResult::pass("tools were called in the expected order")
                } else {
                    AssertionResult::fail(
                        format!(
                            "expected {} to be called after the preceding tools",
                            matchers[next].assertion.describe()
                        ),
                        Vec::new(),
                    )
                }
            }));
        }

        if self.no_duplicate_calls {
            let mut seen = HashSet::new();
            let duplicates: Vec<String> = calls
                .iter()
                .filter(|c| {
                    let args = c.arguments.as_ref().map(|a| a.to_string()).unwrap_or_default();
                    !seen.insert((c.server.as_str(), c.name.as_str(), args))
                })
                .map(|c| format!("{}/{} was called more than once with the same arguments", c.server, c.name))
                .collect();
            out.no_duplicate_calls = Some(if duplicates.is_empty() {
                AssertionResult::pass("no duplicate calls")
            } else {
                AssertionResult::fail("duplicate calls found", duplicates)
            });
        }

        out
    }
}

fn with_matchers(
    assertions: &[ToolAssertion],
    check: impl FnOnce(&[ToolMatcher<'_>]) -> AssertionResult,
) -> AssertionResult {
    match assertions
        .iter()
        .map(ToolAssertion::matcher)
        .collect::<ConfigResult<Vec<_>>>()
    {
        Ok(matchers) => check(&matchers),
        Err(e) => AssertionResult::fail(e.to_string(), Vec::new()),
    }
}
