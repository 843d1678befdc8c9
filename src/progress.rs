// progress.rs

use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar in the house style; `unit` names what is being counted.
pub(crate) fn bar(len: u64, unit: &str) -> ProgressBar {
    let template = format!(
        "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {} ({{percent}}%) ETA: {{eta}}",
        unit
    );
    let style = match ProgressStyle::default_bar().template(&template) {
        Ok(style) => style.progress_chars("=> "),
        Err(e) => {
            log::warn!("Failed to create progress bar style: {}", e);
            ProgressStyle::default_bar()
        }
    };
    ProgressBar::new(len).with_style(style)
}
