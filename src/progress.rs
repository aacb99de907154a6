use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Controls how step output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners + ring-buffer logs, clear logs on completion.
    Normal,
    /// Like Normal but keeps log lines after step completion.
    Verbose,
    /// Spinners only, no log lines.
    Quiet,
    /// No ANSI, plain println output (for piped/non-TTY).
    Plain,
    /// Nothing at all; stdout is reserved for JSON.
    Silent,
}

/// Numbered steps with spinners and a check or cross on completion.
pub struct StepProgress {
    multi: MultiProgress,
    total_steps: usize,
    current_step: usize,
    mode: OutputMode,
}

/// State shared between a [`Step`] and `StepProgress::run()`, which keeps
/// its own clone so it can finalize the bar after the step is dropped.
struct StepState {
    log_lines: VecDeque<String>,
    done_label: Option<String>,
    failed: bool,
}

/// Handle passed into the step closure for logging during execution.
///
/// Log lines are extra lines of the spinner's message rather than separate
/// bars, so indicatif's terminal line count stays correct on redraw.
pub struct Step {
    bar: ProgressBar,
    state: Arc<Mutex<StepState>>,
    label: String,
    mode: OutputMode,
}

fn lock(state: &Mutex<StepState>) -> MutexGuard<'_, StepState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn spinner_style() -> ProgressStyle {
    style("[{prefix}] {spinner:.cyan} {msg}")
}

fn done_style() -> ProgressStyle {
    style("[{prefix}] \u{2713} {msg:.green}")
}

fn failed_style() -> ProgressStyle {
    style("[{prefix}] \u{2717} {msg:.red}")
}

const MAX_LOG_LINES: usize = 10;

impl StepProgress {
    pub fn new(total_steps: usize, mode: OutputMode) -> Self {
        let multi = if matches!(mode, OutputMode::Plain | OutputMode::Silent) {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self {
            multi,
            total_steps,
            current_step: 0,
            mode,
        }
    }

    /// Run an async task as a numbered step.
    ///
    /// Shows a spinner while running. Finalization happens here, not in
    /// `Step::drop`, so steps whose async block doesn't capture the handle
    /// still get their check or cross. A step is marked failed when the
    /// closure called [`Step::fail`] or returned `Err`.
    pub async fn run<F, Fut, T, E>(&mut self, label: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.current_step += 1;
        let prefix = format!("{}/{}", self.current_step, self.total_steps);

        if self.mode == OutputMode::Plain {
            println!("[{prefix}] {label}");
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_prefix(prefix.clone());
        bar.set_message(label.to_string());
        bar.enable_steady_tick(std::time::Duration::from_millis(80));

        let state = Arc::new(Mutex::new(StepState {
            log_lines: VecDeque::new(),
            done_label: None,
            failed: false,
        }));

        let step = Step {
            bar: bar.clone(),
            state: state.clone(),
            label: label.to_string(),
            mode: self.mode,
        };

        let result = f(step).await;

        let st = lock(&state);
        let failed = st.failed || result.is_err();

        // Verbose keeps the log lines above the managed area once the bar
        // collapses back to a single line.
        if self.mode == OutputMode::Verbose {
            for line in &st.log_lines {
                self.multi.println(format!("        {line}")).ok();
            }
        }

        let done_label = st
            .done_label
            .clone()
            .unwrap_or_else(|| label.to_string());
        drop(st);

        if self.mode == OutputMode::Plain {
            let mark = if failed { '\u{2717}' } else { '\u{2713}' };
            println!("[{prefix}] {mark} {done_label}");
        }

        bar.set_style(if failed { failed_style() } else { done_style() });
        bar.finish_with_message(done_label);

        result
    }

    /// Print an info line under the current step.
    pub fn info(&self, text: &str) {
        match self.mode {
            OutputMode::Silent => {}
            OutputMode::Plain => println!("      \u{2192} {text}"),
            _ => {
                self.multi.println(format!("      \u{2192} {text}")).ok();
            }
        }
    }
}

impl Step {
    /// Add a log line under this step (ring buffer of ~10).
    pub fn log(&self, line: &str) {
        match self.mode {
            OutputMode::Quiet | OutputMode::Silent => return,
            OutputMode::Plain => {
                for sub in line.split('\n') {
                    println!("        {sub}");
                }
                return;
            }
            OutputMode::Normal | OutputMode::Verbose => {}
        }

        let mut state = lock(&self.state);

        // One ring-buffer entry per visual line keeps indicatif's count right.
        for sub in line.split('\n') {
            if state.log_lines.len() >= MAX_LOG_LINES {
                state.log_lines.pop_front();
            }
            state.log_lines.push_back(sub.to_string());
        }

        let mut msg = self.label.clone();
        for log_line in &state.log_lines {
            msg.push_str("\n        ");
            msg.push_str(log_line);
        }
        self.bar.set_message(msg);
    }

    /// Override the completion label.
    pub fn set_done_label(&self, label: impl Into<String>) {
        lock(&self.state).done_label = Some(label.into());
    }

    /// Mark the step failed with `label` shown next to the cross.
    pub fn fail(&self, label: impl Into<String>) {
        let mut state = lock(&self.state);
        state.failed = true;
        state.done_label = Some(label.into());
    }
}
