use std::sync::{
    OnceLock,
    atomic::{AtomicBool, Ordering},
};

pub const RECORD_ENV: &str = "SQLREPLAY_RECORD";
pub const RECORD_FLAG: &str = "--record";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Calls go to the real backend and are captured.
    Recording,
    /// Calls are answered from a stored recording.
    Playback,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Playback => "playback",
        }
    }
}

static PROCESS_MODE: OnceLock<Mode> = OnceLock::new();
static CONFIG_RECORD: AtomicBool = AtomicBool::new(false);

/// Mode used by sessions that do not pick one explicitly. Resolved on first
/// use and fixed for the rest of the process.
pub fn process_mode() -> Mode {
    *PROCESS_MODE.get_or_init(|| {
        let env = std::env::var(RECORD_ENV).ok();
        let mode = resolve_record_mode(
            env.as_deref(),
            std::env::args().skip(1),
            CONFIG_RECORD.load(Ordering::Relaxed),
        );
        tracing::debug!(mode = mode.as_str(), "resolved record mode");
        mode
    })
}

/// Pins the process mode before anything resolved it. Returns the mode that
/// was already in effect otherwise.
pub fn set_process_mode(mode: Mode) -> Result<(), Mode> {
    PROCESS_MODE.set(mode).map_err(|_| process_mode())
}

/// Config-file fallback, consulted only if the environment and arguments say
/// nothing.
pub fn set_config_default(record: bool) {
    CONFIG_RECORD.store(record, Ordering::Relaxed);
}

pub fn resolve_record_mode<I, S>(env: Option<&str>, args: I, config_record: bool) -> Mode
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    if let Some(raw) = env {
        match parse_flag(raw) {
            Some(record) => return mode_for(record),
            None => tracing::warn!(
                value = raw,
                "ignoring {RECORD_ENV}; expected one of 1, true, yes, on, 0, false, no, off"
            ),
        }
    }

    for arg in args {
        let arg = arg.as_ref();
        if arg == RECORD_FLAG {
            return Mode::Recording;
        }
        let flag_value = arg
            .strip_prefix(RECORD_FLAG)
            .and_then(|rest| rest.strip_prefix('='))
            .and_then(parse_flag);
        if let Some(record) = flag_value {
            return mode_for(record);
        }
    }

    mode_for(config_record)
}

fn mode_for(record: bool) -> Mode {
    if record { Mode::Recording } else { Mode::Playback }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
