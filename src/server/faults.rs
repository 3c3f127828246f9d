use std::path::Path;

/// Fatal line whose failure is expected when it belongs to the second DC promotion task
const DC_PROMOTION_FAILURE: &str = "Unhandled exception while executing module: Verification of prerequisites for Domain Controller promotion failed. Role change is in progress or this computer needs to be restarted";
const DC_PROMOTION_TASK: &str = "TASK [Promote this server to Additional DC 2]";

lazy_static::lazy_static! {
    static ref FATAL_RE: regex::Regex =
        regex::Regex::new(r"^fatal:.*$|^failed:.*$|^ERROR! .*$").expect("valid regex");
    static ref IGNORING_RE: regex::Regex = regex::Regex::new(r"\.\.\.ignoring$").expect("valid regex");
}

fn is_fatal(line: &str) -> bool {
    FATAL_RE.is_match(line)
}

/// Turn literal `\r\n` and `\n` escapes of a playbook error into real newlines
fn normalize(line: &str) -> String {
    line.replace("\\r\\n", "\n").replace("\\n", "\n")
}

/// Extract the fatal lines of a playbook run that were not ignored.
///
/// A fatal line immediately followed by a `...ignoring` line is dropped, as is
/// the known DC promotion failure when its task header sits two lines above it.
pub fn scan_faults(text: &str) -> Vec<String> {
    let mut faults = Vec::new();
    let mut three_ago = "";
    let mut two_ago = "";
    let mut previous = "";

    for line in text.lines() {
        if IGNORING_RE.is_match(line) && is_fatal(previous) {
            previous = "";
            continue;
        }

        if is_fatal(previous) {
            let expected_dc_failure =
                previous.contains(DC_PROMOTION_FAILURE) && three_ago.contains(DC_PROMOTION_TASK);
            if !expected_dc_failure {
                faults.push(normalize(previous));
            }
        }

        three_ago = two_ago;
        two_ago = previous;
        previous = line;
    }

    if is_fatal(previous) {
        faults.push(normalize(previous));
    }
    faults
}

/// Scan a log file; an unreadable file yields a single fault describing why
pub async fn scan_fault_file(path: &Path) -> Vec<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => scan_faults(&String::from_utf8_lossy(&bytes)),
        Err(e) => vec![format!("Could not read {}: {}", path.display(), e)],
    }
}
