use indicatif::ProgressStyle;

/// Extension trait for creating labelled progress bars.
pub trait NamedProgress {
    /// Creates a bar style prefixed with `name`, padded to a fixed column.
    fn named_bar(name: &str) -> Self;
}

const LABEL_WIDTH: usize = 28;

impl NamedProgress for ProgressStyle {
    fn named_bar(name: &str) -> Self {
        let template = format!(
            "{:<width$} {{wide_bar:40.green/white}} {{pos:>5}}/{{len:<5}} [{{elapsed_precise}}] {{msg}}",
            name,
            width = LABEL_WIDTH
        );
        ProgressStyle::default_bar()
            .template(&template)
            .unwrap_or(ProgressStyle::default_bar())
    }
}
