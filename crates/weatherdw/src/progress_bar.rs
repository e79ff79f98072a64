use indicatif::{ProgressBar, ProgressStyle};
use weatherdw_core::progress::Stage;
use weatherdw_core::{LoadProgress, ProgressSink, TracingProgress};

const FACT_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg} [{per_sec}] ETA: {eta}";

/// Terminal progress for the `load` command. Events are still forwarded to `tracing`.
pub struct ProgressBarSink {
    bar: ProgressBar,
    log: TracingProgress,
}

impl ProgressBarSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_message("starting");
        Self {
            bar,
            log: TracingProgress,
        }
    }

    fn fact_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template(FACT_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressBarSink {
    fn on_progress(&self, event: &LoadProgress) {
        self.bar.suspend(|| self.log.on_progress(event));

        match event {
            LoadProgress::StageStarted { stage } => {
                self.bar.set_message(stage_label(*stage));
                self.bar.tick();
            }
            LoadProgress::FactsStarted {
                total_rows,
                already_committed,
                ..
            } => {
                self.bar.set_style(Self::fact_style());
                self.bar.set_length(*total_rows);
                self.bar.set_position(*already_committed);
                self.bar.set_message("fact rows");
            }
            LoadProgress::BatchCommitted { committed_rows, .. } => {
                self.bar.set_position(*committed_rows);
            }
            LoadProgress::Finished { committed_rows } => {
                self.bar.set_position(*committed_rows);
                self.bar.finish_with_message("done");
            }
            LoadProgress::SourceScanned { .. } | LoadProgress::DimensionLoaded { .. } => {}
        }
    }
}

impl Drop for ProgressBarSink {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}

fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Schema => "checking schema",
        Stage::SourceScan => "scanning source file",
        Stage::DateDimension => "loading date dimension",
        Stage::StationDimension => "loading station dimension",
        Stage::Facts => "loading facts",
    }
}
