//! Line-based playback controls (stdin stands in for hotkeys).

use std::io::BufRead;
use std::thread::{self, JoinHandle};

use beatbar_types::{PlaybackAction, UnknownAction};
use stream_player::PlayerHandle;

/// Parse one input line. Blank lines yield `None`.
pub fn parse_control_line(line: &str) -> Option<Result<PlaybackAction, UnknownAction>> {
    let word = line.trim();
    if word.is_empty() {
        return None;
    }
    Some(word.parse())
}

/// Forward actions read from `input` to the player until EOF, `exit`, or the player
/// goes away.
pub fn spawn_controls<R>(input: R, handle: PlayerHandle) -> std::io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("controls".to_string())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!("control input error: {e}");
                        break;
                    }
                };
                match parse_control_line(&line) {
                    None => {}
                    Some(Ok(action)) => {
                        tracing::debug!(action = ?action, "control");
                        if !handle.send(action) || action == PlaybackAction::Exit {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("{e} (try: pause, resume, next, prev, restart, stop, exit, vol+, vol-, mute)");
                    }
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_skipped() {
        assert!(parse_control_line("   ").is_none());
        assert_eq!(parse_control_line(" next\n"), Some(Ok(PlaybackAction::Next)));
        assert!(matches!(parse_control_line("louder"), Some(Err(_))));
    }
}
