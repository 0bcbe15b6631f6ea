use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Progress bar for documents sent to Elasticsearch, `None` in quiet mode
pub fn setup_index_bar(total: Option<u64>, label: &str, quiet: bool) -> Option<ProgressBar> {
    if quiet {
        return None;
    }
    let pb = ProgressBar::with_draw_target(total, ProgressDrawTarget::stderr());
    let template = format!(
        "{{spinner:.green}} [{{elapsed_precise}}] [{{wide_bar:.cyan/blue}}] {}: {{pos}}/{{len}} ({{per_sec}}, {{msg}}) {{eta}}",
        label
    );
    match ProgressStyle::default_bar().template(&template) {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => log::debug!("Falling back to the default progress style: {}", e),
    }
    pb.set_message("Indexing...");
    Some(pb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_has_no_bar() {
        assert!(setup_index_bar(Some(10), "Complaints", true).is_none());
    }

    #[test]
    fn test_bar_length() {
        let bar = setup_index_bar(Some(10), "Complaints", false).unwrap();
        assert_eq!(bar.length(), Some(10));
        bar.finish_and_clear();

        let bar = setup_index_bar(None, "Complaints", false).unwrap();
        assert_eq!(bar.length(), None);
        bar.finish_and_clear();
    }
}
