use crate::pusher::PushMessage;
use indicatif::{ProgressBar, ProgressStyle};

pub struct BuildProgress {
    progress_bar: ProgressBar,
}

impl BuildProgress {
    pub fn new(app_name: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) =
            ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            pb.set_style(style);
        }
        pb.set_message(format!("Building {}...", app_name));

        Self { progress_bar: pb }
    }

    pub fn set_message(&self, msg: &str) {
        self.progress_bar.set_message(msg.to_string());
    }

    pub fn finish_success(&self) {
        self.progress_bar.finish_with_message("Build completed ✓");
    }

    pub fn finish_error(&self, error: &str) {
        self.progress_bar
            .finish_with_message(format!("Build failed: {}", error));
    }
}

/// Overall push progress as a percentage bar
pub struct PushProgressBar {
    progress_bar: ProgressBar,
}

impl PushProgressBar {
    pub fn new(image: &str) -> Self {
        let pb = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_message(format!("Pushing {}", image));

        Self { progress_bar: pb }
    }

    pub fn update(&self, message: &PushMessage) {
        self.progress_bar.set_position(message.progress.round() as u64);
        self.progress_bar.set_message(format!(
            "{}/{} layers",
            message.layers_complete, message.layers_total
        ));
    }

    pub fn finish_success(&self) {
        self.progress_bar.set_position(100);
        self.progress_bar.finish_with_message("Push completed ✓");
    }

    pub fn finish_error(&self, error: &str) {
        self.progress_bar
            .abandon_with_message(format!("Push failed: {}", error));
    }
}
