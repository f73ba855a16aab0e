//! Compact pass/fail summary of a results file.

use serde::Serialize;

use crate::eval::EvalResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub name: String,
    pub task_passed: bool,
    pub assertions_passed: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub task_error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_assertions: Vec<String>,
    pub judge_input_tokens: u64,
    pub judge_output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryOutput {
    pub results_file: String,
    pub tasks: Vec<TaskSummary>,
    pub tasks_total: usize,
    pub tasks_passed: usize,
    pub task_pass_rate: f64,
    pub assertions_total: usize,
    pub assertions_passed: usize,
    pub assertion_pass_rate: f64,
    pub judge_total_input_tokens: u64,
    pub judge_total_output_tokens: u64,
}

pub fn build_summary(results_file: &str, results: &[EvalResult]) -> SummaryOutput {
    let mut summary = SummaryOutput {
        results_file: results_file.to_string(),
        tasks_total: results.len(),
        ..Default::default()
    };

    for result in results {
        let mut task = TaskSummary {
            name: result.task_name.clone(),
            task_passed: result.task_passed,
            assertions_passed: result.all_assertions_passed,
            ..Default::default()
        };

        if result.task_passed {
            summary.tasks_passed += 1;
        } else if result.agent_execution_error {
            task.task_error = "Agent execution failed".to_string();
        } else {
            task.task_error = result.task_error.clone();
        }

        if let Some(assertions) = &result.assertion_results {
            for (name, outcome) in assertions.named_results() {
                summary.assertions_total += 1;
                if outcome.passed {
                    summary.assertions_passed += 1;
                } else {
                    task.failed_assertions
                        .push(format!("{}: {}", name, outcome.reason));
                }
            }
        }

        if let Some(usage) = &result.judge_token_usage {
            task.judge_input_tokens = usage.input_tokens;
            task.judge_output_tokens = usage.output_tokens;
            summary.judge_total_input_tokens += usage.input_tokens;
            summary.judge_total_output_tokens += usage.output_tokens;
        }

        summary.tasks.push(task);
    }

    if summary.tasks_total > 0 {
        summary.task_pass_rate = summary.tasks_passed as f64 / summary.tasks_total as f64;
    }
    if summary.assertions_total > 0 {
        summary.assertion_pass_rate =
            summary.assertions_passed as f64 / summary.assertions_total as f64;
    }

    summary
}

pub fn print_text_summary(summary: &SummaryOutput) {
    println!("=== Evaluation Summary ===");
    println!();
    for task in &summary.tasks {
        let icon = match (task.task_passed, task.assertions_passed) {
            (true, true) => "✓",
            (true, false) => "~",
            _ => "✗",
        };
        println!("  {} {}", icon, task.name);
        if !task.task_error.is_empty() {
            println!("      error: {}", task.task_error);
        }
        for failed in &task.failed_assertions {
            println!("      assertion failed: {}", failed);
        }
    }
    println!();
    println!(
        "Tasks:      {}/{} passed ({:.0}%)",
        summary.tasks_passed,
        summary.tasks_total,
        summary.task_pass_rate * 100.0
    );
    if summary.assertions_total > 0 {
        println!(
            "Assertions: {}/{} passed ({:.0}%)",
            summary.assertions_passed,
            summary.assertions_total,
            summary.assertion_pass_rate * 100.0
        );
    }
    if summary.judge_total_input_tokens + summary.judge_total_output_tokens > 0 {
        println!(
            "Judge tokens: {} in / {} out",
            summary.judge_total_input_tokens, summary.judge_total_output_tokens
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{AssertionResult, CompositeAssertionResult};
    use crate::judge::TokenUsage;

    #[test]
    fn test_build_summary() {
        let results = vec![
            EvalResult {
                task_name: "ok".into(),
                task_passed: true,
                all_assertions_passed: true,
                judge_token_usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 2,
                }),
                ..Default::default()
            },
            EvalResult {
                task_name: "agent-broke".into(),
                agent_execution_error: true,
                task_error: "failed to run agent: boom".into(),
                assertion_results: Some(CompositeAssertionResult {
                    min_tool_calls: Some(AssertionResult {
                        passed: false,
                        reason: "expected at least 1 tool calls, got 0".into(),
                        details: vec![],
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];

        let summary = build_summary("out.json", &results);
        assert_eq!(summary.tasks_passed, 1);
        assert_eq!(summary.task_pass_rate, 0.5);
        assert_eq!(summary.assertions_total, 1);
        assert_eq!(summary.assertions_passed, 0);
        assert_eq!(summary.tasks[1].task_error, "Agent execution failed");
        assert_eq!(
            summary.tasks[1].failed_assertions,
            vec!["minToolCalls: expected at least 1 tool calls, got 0"]
        );
        assert_eq!(summary.judge_total_input_tokens, 10);
    }
}
