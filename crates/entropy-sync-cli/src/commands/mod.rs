pub mod status;
pub mod sync;

use entropy_sync::Feedback;

/// Repository notes go to stderr, indented under the repository line.
/// Plain info is only shown with `-v`.
pub fn print_feedback(feedback: &[Feedback]) {
    for note in feedback {
        if note.is_info() {
            tracing::info!("{note}");
        } else {
            eprintln!("  {note}");
        }
    }
}
