use crate::deferred::LogLevel;
use crate::merge::MergeAction;
use crate::{ApplyReport, StatusReport};

/// Renders the provisioning outcome for the terminal.
pub fn print_apply_report(report: &ApplyReport) {
    println!("Preflight provisioning");
    println!("  Provider    : {}", report.provider);
    if report.requested_profiles.is_empty() {
        println!("  Profiles    : (none requested)");
    } else {
        println!("  Profiles    : {}", report.requested_profiles.join(", "));
    }
    if report.profile_dirs.is_empty() {
        println!("  Resolved    : (no profile directories)");
    } else {
        println!("  Resolved    :");
        for dir in &report.profile_dirs {
            println!("    - {}", dir.display());
        }
    }
    match &report.merge {
        Some(outcome) => {
            let label = match outcome.action {
                MergeAction::Written => "written",
                MergeAction::Redirected => "redirected",
                MergeAction::Skipped => "skipped, external customization",
            };
            println!("  Preferences : {} ({label})", outcome.path.display());
        }
        None => println!("  Preferences : (not written)"),
    }
    if let Some(err) = &report.fetch_error {
        println!("  Fetch error : {err}");
    }
    if let Some(err) = &report.merge_error {
        println!("  Merge error : {err}");
    }
    if !report.log_records.is_empty() {
        println!("  Log         :");
        for record in &report.log_records {
            let level = match record.level {
                LogLevel::Info => "info ",
                LogLevel::Warn => "warn ",
                LogLevel::Error => "error",
            };
            println!("    [{level}] {}", record.message);
        }
    }
}

/// Renders the provider selection and cache state for the terminal.
pub fn print_status(status: &StatusReport) {
    println!("Preflight status");
    println!("  Provider    : {}", status.provider);
    if status.requested_profiles.is_empty() {
        println!("  Profiles    : (none requested)");
    } else {
        println!("  Profiles    : {}", status.requested_profiles.join(", "));
    }
    match &status.profiles_location {
        Some(location) => println!("  Location    : {location}"),
        None => println!("  Location    : (unset)"),
    }
    match &status.local_profiles_location {
        Some(path) => println!("  Local source: {}", path.display()),
        None => println!("  Local source: (unset)"),
    }
    if status.cache_exists {
        println!(
            "  Cache       : {} ({} origin headers)",
            status.cache_dir.display(),
            status.origin_header_count
        );
    } else {
        println!("  Cache       : (missing) {}", status.cache_dir.display());
    }
    if status.combined_file_exists {
        println!("  Preferences : {}", status.combined_file.display());
    } else {
        println!(
            "  Preferences : (missing) {}",
            status.combined_file.display()
        );
    }
}
