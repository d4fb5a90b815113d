//! Shared utility functions.

/// Truncate a string to `max` characters for display, appending an
/// ellipsis when anything was cut.
pub fn truncate_for_display(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{}\u{2026}", cut)
}
