use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use chainer_core::{status, ActionState, CurrentState, Package, Packages, Payload};
use chainer_engine::{ApplyResult, EngineObserver, ErrorResponse, RestartState};
use chainer_plan::{PackageOutcome, Plan};
use chainer_resume::ResumeType;
use indicatif::{HumanBytes, HumanCount, ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UiMode {
    Plain,
    Interactive,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
    mode: UiMode,
}

pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    total: u64,
    current: u64,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self {
            style,
            mode: ui_mode_from_style(style),
        }
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.mode, title) {
            println!();
            let rendered = match self.style {
                OutputStyle::Plain => line,
                OutputStyle::Rich => colorize(section_style(), &line),
            };
            println!("{rendered}");
        }
    }

    pub(crate) fn start_progress(self, label: &str, total: u64) -> TerminalProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new(total.max(1));
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<12} [{bar:20.cyan/blue}] {pos:>3}/{len:3} {elapsed_precise}",
            ) {
                progress_bar.set_style(
                    style
                        .tick_chars(progress_tick_chars(label))
                        .progress_chars("=>-"),
                );
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            total,
            current: 0,
            progress_bar,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }
}

impl TerminalProgress {
    fn set(&mut self, current: u64) {
        self.current = current.min(self.total);

        let Some(progress_bar) = &self.progress_bar else {
            return;
        };

        let safe_total = self.total.max(1);
        progress_bar.set_length(safe_total);
        progress_bar.set_position(self.current.min(safe_total));
    }

    fn advance(&mut self) {
        self.set(self.current + 1);
    }

    /// Writes a line above the bar without tearing it.
    fn println(&self, line: &str) {
        match &self.progress_bar {
            Some(progress_bar) => progress_bar.println(line),
            None => println!("{line}"),
        }
    }

    fn finish_success(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &self.label,
            self.current,
            self.total,
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }

    fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

/// Prints engine lifecycle events. Failures of non-vital packages are
/// skipped; vital ones roll back whatever the answer.
pub(crate) struct TerminalObserver {
    renderer: TerminalRenderer,
    progress: Option<TerminalProgress>,
}

impl TerminalObserver {
    pub(crate) fn new(style: OutputStyle) -> Self {
        Self {
            renderer: TerminalRenderer::from_style(style),
            progress: None,
        }
    }

    fn line(&self, status: &str, message: &str) {
        let line = render_status_line(self.renderer.style, status, message);
        match &self.progress {
            Some(progress) => progress.println(&line),
            None => println!("{line}"),
        }
    }
}

impl EngineObserver for TerminalObserver {
    fn on_detect_complete(&mut self, resume: ResumeType) {
        if resume != ResumeType::None {
            self.line("info", &format!("resuming previous run ({})", resume.as_str()));
        }
    }

    fn on_apply_begin(&mut self, plan: &Plan) {
        self.renderer.print_section(plan.action().as_str());
        self.progress = Some(
            self.renderer
                .start_progress(plan.action().as_str(), plan.execute_count() as u64),
        );
    }

    fn on_cache_payload_complete(&mut self, package: &Package, payload: &Payload, code: u32) {
        if status::failed(code) {
            self.line(
                "warn",
                &format!(
                    "caching {} for {} failed: {}",
                    payload.file_name,
                    package.id,
                    status::describe(code)
                ),
            );
        }
    }

    fn on_execute_package_complete(
        &mut self,
        package: &Package,
        outcome: PackageOutcome,
        rollback: bool,
    ) {
        let badge = if outcome.is_failure() { "warn" } else { "ok" };
        let verb = if rollback { "rolled back" } else { "processed" };
        self.line(
            badge,
            &format!("{verb} {} ({})", package.id, outcome_label(outcome)),
        );
        if !rollback {
            if let Some(progress) = self.progress.as_mut() {
                progress.advance();
            }
        }
    }

    fn on_error(&mut self, package: &Package, code: u32, message: &str) -> ErrorResponse {
        self.line(
            "error",
            &format!(
                "{} failed with {}: {message}",
                package.id,
                status::describe(code)
            ),
        );
        ErrorResponse::Continue
    }

    fn on_apply_complete(&mut self, result: &ApplyResult) {
        if let Some(progress) = self.progress.take() {
            if result.succeeded() {
                progress.finish_success();
            } else {
                progress.finish_abandon();
            }
        }
        for line in format_apply_summary(self.renderer.style, result) {
            println!("{line}");
        }
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("[{}] {message}", status.to_ascii_uppercase()),
    }
}

pub(crate) fn format_apply_summary(style: OutputStyle, result: &ApplyResult) -> Vec<String> {
    let mut lines = Vec::new();
    let headline = if result.succeeded() {
        render_status_line(style, "ok", "apply complete")
    } else if result.rolled_back {
        render_status_line(
            style,
            "error",
            &format!(
                "apply failed with {}; changes were rolled back",
                status::describe(result.status)
            ),
        )
    } else {
        render_status_line(
            style,
            "error",
            &format!(
                "apply failed with {}",
                status::describe(result.status)
            ),
        )
    };
    lines.push(headline);

    match result.restart {
        RestartState::None => {}
        RestartState::Required => lines.push(render_status_line(
            style,
            "warn",
            "a restart is required to finish",
        )),
        RestartState::Initiated => lines.push(render_status_line(
            style,
            "warn",
            "a restart was initiated; the run continues after reboot",
        )),
    }
    lines
}

pub(crate) fn format_detect_lines(resume: ResumeType, packages: &Packages) -> Vec<String> {
    let mut lines = vec![format!("resume: {}", resume.as_str())];
    for package in packages.iter() {
        let version = package
            .installed_version
            .as_ref()
            .map(|version| format!(" {version}"))
            .unwrap_or_default();
        lines.push(format!(
            "{} {} ({}){version}, {}",
            package.id,
            current_state_label(package.current_state),
            package.kind.as_str(),
            if package.cached { "cached" } else { "not cached" }
        ));
    }
    lines
}

pub(crate) fn format_plan_lines(plan: &Plan, packages: &Packages) -> Vec<String> {
    let mut lines = vec![format!(
        "plan: {} ({} to cache, {} to execute, {})",
        plan.action().as_str(),
        HumanCount(plan.cache_count() as u64),
        HumanCount(plan.execute_count() as u64),
        HumanBytes(plan.estimated_size())
    )];
    for entry in plan.execute_entries() {
        let id = packages
            .get(entry.package)
            .map(|package| package.id.as_str())
            .unwrap_or("<unknown>");
        let mut line = format!("  {id}: {}", entry.action);
        if entry.rollback_action != ActionState::None {
            line.push_str(&format!(", rollback {}", entry.rollback_action));
        }
        if !entry.owned {
            line.push_str(" [elevated]");
        }
        lines.push(line);
    }
    if plan.execute_count() == 0 {
        lines.push("  nothing to do".to_string());
    }
    lines
}

pub(crate) fn current_state_label(state: CurrentState) -> &'static str {
    match state {
        CurrentState::Unknown => "unknown",
        CurrentState::Absent => "absent",
        CurrentState::Present => "present",
    }
}

fn outcome_label(outcome: PackageOutcome) -> String {
    match outcome {
        PackageOutcome::Success => "success".to_string(),
        PackageOutcome::ScheduleReboot => "restart required".to_string(),
        PackageOutcome::ForceReboot => "restart initiated".to_string(),
        PackageOutcome::Failed(code) => status::describe(code),
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn progress_tick_chars(label: &str) -> &'static str {
    match label {
        "install" => ".oO@* ",
        "modify" => "-=~* ",
        "repair" => "<^>v ",
        "uninstall" => "\\|/- ",
        _ => "|/-\\ ",
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn ui_mode_from_style(style: OutputStyle) -> UiMode {
    match style {
        OutputStyle::Plain => UiMode::Plain,
        OutputStyle::Rich => UiMode::Interactive,
    }
}

fn render_section_header(mode: UiMode, title: &str) -> Option<String> {
    match mode {
        UiMode::Plain => None,
        UiMode::Interactive => Some(format!("== {title} ==")),
    }
}

fn render_progress_line(
    style: OutputStyle,
    label: &str,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = ((bounded_current as usize) * width) / (safe_total as usize);
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let percent = (bounded_current * 100) / safe_total;
    let counts = format!("{}/{}", HumanCount(current), HumanCount(total));
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}
