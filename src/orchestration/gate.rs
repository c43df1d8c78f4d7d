//! Sanity gate: turn a stage's captured output into a verdict.
//!
//! Checks that do not hold are regressions (`Failed`); checks that cannot be
//! evaluated at all are infrastructure problems (`Errored`), which win over
//! failures.

use crate::core::expr;
use crate::core::template::{render, TemplateContext};
use crate::orchestration::executor::{StageJob, StageOutput};
use crate::pipeline::{CheckSpec, Stream};
use crate::blog_debug;
use regex::Regex;
use std::borrow::Cow;

/// Outcome of the sanity gate for one instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Passed,
    Failed(Vec<String>),
    Errored(String),
}

impl Verdict {
    pub fn is_passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }
}

/// Relative tolerance when comparing extracted numbers.
const TOLERANCE: f64 = 1e-9;

fn approx_eq(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() <= TOLERANCE * expected.abs().max(1.0)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[derive(Default)]
struct Findings {
    failures: Vec<String>,
    errors: Vec<String>,
}

impl Findings {
    fn fail(&mut self, msg: String) {
        self.failures.push(msg);
    }

    fn error(&mut self, msg: String) {
        self.errors.push(msg);
    }

    fn into_verdict(self) -> Verdict {
        if !self.errors.is_empty() {
            Verdict::Errored(self.errors.join("; "))
        } else if !self.failures.is_empty() {
            Verdict::Failed(self.failures)
        } else {
            Verdict::Passed
        }
    }
}

pub struct SanityGate;

impl SanityGate {
    /// Evaluate every check declared on the job's kind.
    pub fn evaluate(job: &StageJob, output: &StageOutput) -> Verdict {
        let ctx = job.local_context();
        let numbers = TemplateContext::numeric_from_params(&job.key.params);
        let mut findings = Findings::default();

        let explicit_exit = job
            .kind
            .checks
            .iter()
            .any(|c| matches!(c, CheckSpec::ExitCode { .. }));
        if !explicit_exit {
            match output.exit_code {
                Some(0) => {}
                Some(code) => findings.fail(format!("exited with code {}", code)),
                None => findings.error("killed by signal".to_string()),
            }
        }

        for check in &job.kind.checks {
            Self::run_check(check, job, output, &ctx, &numbers, &mut findings);
        }

        let verdict = findings.into_verdict();
        blog_debug!("{}: verdict {:?}", job.key, verdict);
        verdict
    }

    fn run_check(
        check: &CheckSpec,
        job: &StageJob,
        output: &StageOutput,
        ctx: &TemplateContext,
        numbers: &TemplateContext,
        findings: &mut Findings,
    ) {
        match check {
            CheckSpec::Found { pattern, stream } => {
                let Some(re) = compile(pattern, findings) else { return };
                if !re.is_match(&text(output, *stream)) {
                    findings.fail(format!("pattern '{}' not found in {}", pattern, name(*stream)));
                }
            }
            CheckSpec::NotFound { pattern, stream } => {
                let Some(re) = compile(pattern, findings) else { return };
                if let Some(m) = re.find(&text(output, *stream)) {
                    findings.fail(format!(
                        "pattern '{}' unexpectedly matched '{}' in {}",
                        pattern,
                        m.as_str(),
                        name(*stream)
                    ));
                }
            }
            CheckSpec::ExtractEq {
                pattern,
                expected,
                stream,
            } => {
                let Some(re) = compile(pattern, findings) else { return };
                let Some(want) = expected_value(expected, numbers, findings) else { return };
                let haystack = text(output, *stream);
                let Some(caps) = re.captures(&haystack) else {
                    findings.fail(format!("pattern '{}' not found in {}", pattern, name(*stream)));
                    return;
                };
                let captured = caps.get(1).or_else(|| caps.get(0)).map_or("", |m| m.as_str());
                match captured.trim().parse::<f64>() {
                    Ok(got) if approx_eq(got, want) => {}
                    Ok(got) => findings.fail(format!(
                        "'{}' extracted {}, expected {} ({})",
                        pattern,
                        format_number(got),
                        format_number(want),
                        expected
                    )),
                    Err(_) => findings.error(format!(
                        "'{}' captured '{}', which is not a number",
                        pattern, captured
                    )),
                }
            }
            CheckSpec::CountEq {
                pattern,
                expected,
                stream,
            } => {
                let Some(re) = compile(pattern, findings) else { return };
                let Some(want) = expected_value(expected, numbers, findings) else { return };
                let count = re.find_iter(&text(output, *stream)).count();
                if !approx_eq(count as f64, want) {
                    findings.fail(format!(
                        "'{}' matched {} times, expected {} ({})",
                        pattern,
                        count,
                        format_number(want),
                        expected
                    ));
                }
            }
            CheckSpec::FileExists { path } => {
                let Some(path) = rendered(path, ctx, findings) else { return };
                let resolved = job.resolve_path(&path);
                if !resolved.exists() {
                    findings.fail(format!("expected file {} is missing", resolved.display()));
                }
            }
            CheckSpec::FileContains { path, pattern } => {
                let Some(re) = compile(pattern, findings) else { return };
                let Some(path) = rendered(path, ctx, findings) else { return };
                let resolved = job.resolve_path(&path);
                match std::fs::read_to_string(&resolved) {
                    Ok(content) if re.is_match(&content) => {}
                    Ok(_) => findings.fail(format!(
                        "pattern '{}' not found in {}",
                        pattern,
                        resolved.display()
                    )),
                    Err(e) => findings.error(format!("cannot read {}: {}", resolved.display(), e)),
                }
            }
            CheckSpec::ExitCode { expected } => match output.exit_code {
                Some(code) if code == *expected => {}
                Some(code) => findings.fail(format!("exited with code {}, expected {}", code, expected)),
                None => findings.error("killed by signal".to_string()),
            },
        }
    }
}

fn text(output: &StageOutput, stream: Stream) -> Cow<'_, str> {
    match stream {
        Stream::Stdout => Cow::Borrowed(&output.stdout),
        Stream::Stderr => Cow::Borrowed(&output.stderr),
        Stream::Both => Cow::Owned(format!("{}\n{}", output.stdout, output.stderr)),
    }
}

fn name(stream: Stream) -> &'static str {
    match stream {
        Stream::Stdout => "stdout",
        Stream::Stderr => "stderr",
        Stream::Both => "output",
    }
}

fn compile(pattern: &str, findings: &mut Findings) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            findings.error(format!("invalid pattern '{}': {}", pattern, e));
            None
        }
    }
}

fn rendered(template: &str, ctx: &TemplateContext, findings: &mut Findings) -> Option<String> {
    match render(template, ctx) {
        Ok(s) => Some(s),
        Err(e) => {
            findings.error(e.to_string());
            None
        }
    }
}

fn expected_value(expected: &str, ctx: &TemplateContext, findings: &mut Findings) -> Option<f64> {
    let source = rendered(expected, ctx, findings)?;
    match expr::evaluate(&source) {
        Ok(value) => Some(value),
        Err(e) => {
            findings.error(format!("cannot evaluate '{}': {}", source, e));
            None
        }
    }
}
