/// Alert operations team (critical): source silent, breaker stuck open
pub fn alert_operations_team_critical(message: String) {
    tracing::error!("CRITICAL ALERT: {}", message);

    send_pager_alert(&message, "critical");
    send_chat_alert(&message, "critical");
}

/// Alert operations team (warning)
pub fn alert_operations_team_warning(message: String) {
    tracing::warn!("WARNING ALERT: {}", message);

    send_chat_alert(&message, "warning");
}

// Delivery goes through the log pipeline; the pager and chat bridges tail these targets
fn send_pager_alert(message: &str, severity: &str) {
    tracing::error!(target: "alerts::pager", severity, "{}", message);
}

fn send_chat_alert(message: &str, severity: &str) {
    tracing::info!(target: "alerts::chat", severity, "{}", message);
}

/// Shorten an error chain for run-history summaries.
pub fn truncate_summary(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let mut short: String = message.chars().take(max_chars.saturating_sub(3)).collect();
    short.push_str("...");
    short
}
