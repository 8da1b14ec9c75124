//! Maps classified intents to executable actions on a Linux desktop.

use crate::action::{ActionDescriptor, ActionKind};
use crate::config_loader::Settings;
use crate::intent::{Intent, IntentRecord};
use chrono::{DateTime, Local};
use reqwest::Url;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Folder search stops this many levels below each root.
const FOLDER_SEARCH_DEPTH: usize = 4;
/// Upper bound on directories read per folder search.
const FOLDER_SEARCH_BUDGET: usize = 20_000;

const VOLUME_TARGET: &str = "@DEFAULT_AUDIO_SINK@";

pub trait ActionResolver: Send + Sync {
    fn resolve(&self, record: &IntentRecord) -> ActionDescriptor;
}

/// Built-in spoken name -> program table.
const BUILTIN_APPS: &[(&str, &str)] = &[
    ("chrome", "google-chrome"),
    ("firefox", "firefox"),
    ("notepad", "gedit"),
    ("explorer", "nautilus"),
    ("calculator", "gnome-calculator"),
    ("terminal", "x-terminal-emulator"),
    ("word", "libreoffice --writer"),
    ("excel", "libreoffice --calc"),
    ("powerpoint", "libreoffice --impress"),
    ("spotify", "spotify"),
    ("vlc", "vlc"),
];

type Clock = Box<dyn Fn() -> DateTime<Local> + Send + Sync>;

pub struct DesktopResolver {
    apps: BTreeMap<String, String>,
    common_folders: BTreeMap<String, PathBuf>,
    search_roots: Vec<PathBuf>,
    folder_cache: Mutex<HashMap<String, PathBuf>>,
    clock: Clock,
}

impl DesktopResolver {
    pub fn new(settings: &Settings) -> Self {
        let mut apps: BTreeMap<String, String> = BUILTIN_APPS
            .iter()
            .map(|(name, program)| (name.to_string(), program.to_string()))
            .collect();
        for (name, program) in &settings.apps {
            apps.insert(name.to_lowercase(), program.clone());
        }

        let mut common_folders = BTreeMap::new();
        let xdg = [
            ("documents", dirs::document_dir()),
            ("downloads", dirs::download_dir()),
            ("desktop", dirs::desktop_dir()),
            ("pictures", dirs::picture_dir()),
            ("music", dirs::audio_dir()),
            ("videos", dirs::video_dir()),
            ("home", dirs::home_dir()),
        ];
        for (name, dir) in xdg {
            if let Some(dir) = dir {
                common_folders.insert(name.to_string(), dir);
            }
        }

        let search_roots = [dirs::home_dir(), dirs::desktop_dir(), dirs::document_dir()]
            .into_iter()
            .flatten()
            .collect();

        info!(apps = apps.len(), "action resolver ready");
        Self {
            apps,
            common_folders,
            search_roots,
            folder_cache: Mutex::new(HashMap::new()),
            clock: Box::new(Local::now),
        }
    }

    /// Replace the application table.
    pub fn with_apps<I, K, V>(mut self, apps: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.apps = apps
            .into_iter()
            .map(|(k, v)| (k.into().to_lowercase(), v.into()))
            .collect();
        self
    }

    /// Replace the well-known folders and the roots searched for others.
    pub fn with_folders(
        mut self,
        common: BTreeMap<String, PathBuf>,
        search_roots: Vec<PathBuf>,
    ) -> Self {
        self.common_folders = common;
        self.search_roots = search_roots;
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Local> + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    fn open_app(&self, target: &str) -> ActionDescriptor {
        if let Some(program) = self.apps.get(target) {
            if is_launchable(program) {
                return ActionDescriptor::new(ActionKind::App, program, format!("Opening {target}"));
            }
        }

        // Fuzzy match: either name contains the other.
        for (name, program) in &self.apps {
            if (target.contains(name.as_str()) || name.contains(target)) && is_launchable(program) {
                debug!(target, matched = %name, "fuzzy application match");
                return ActionDescriptor::new(ActionKind::App, program, format!("Opening {name}"));
            }
        }

        if let Some(folder) = self.find_folder(target) {
            return ActionDescriptor::new(
                ActionKind::Folder,
                folder.display().to_string(),
                format!("Opening {target} folder"),
            );
        }

        if let Ok(path) = which::which(target) {
            return ActionDescriptor::new(
                ActionKind::App,
                path.display().to_string(),
                format!("Opening {target}"),
            );
        }

        ActionDescriptor::error(format!("I could not find {target} on your system"))
    }

    fn close_app(&self, target: &str) -> ActionDescriptor {
        // Terminate by the program's process name when the table knows it.
        let process = self
            .apps
            .get(target)
            .and_then(|program| program.split_whitespace().next())
            .and_then(|program| Path::new(program).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| target.to_string());
        ActionDescriptor::new(ActionKind::CloseApp, process, format!("Closing {target}"))
    }

    /// Well-known folders first, then a cached depth-limited search.
    pub fn find_folder(&self, name: &str) -> Option<PathBuf> {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }

        {
            let cache = self.folder_cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(path) = cache.get(&key) {
                if path.is_dir() {
                    return Some(path.clone());
                }
            }
        }

        let found = match self.common_folders.get(&key) {
            Some(path) if path.is_dir() => Some(path.clone()),
            _ => {
                debug!(folder = %key, "searching for folder");
                let mut budget = FOLDER_SEARCH_BUDGET;
                self.search_roots
                    .iter()
                    .filter(|root| root.is_dir())
                    .find_map(|root| search_folder(root, &key, FOLDER_SEARCH_DEPTH, &mut budget))
            }
        };

        if let Some(path) = &found {
            info!(folder = %key, path = %path.display(), "folder found");
            self.folder_cache
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(key, path.clone());
        }
        found
    }

    fn system_command(&self, command: &str) -> ActionDescriptor {
        let (shell, message) = match command {
            "shutdown" => ("systemctl poweroff", "Shutting down the computer"),
            "restart" | "reboot" => ("systemctl reboot", "Restarting the computer"),
            "sleep" => ("systemctl suspend", "Putting computer to sleep"),
            "lock" => ("loginctl lock-session", "Locking the computer"),
            other => return ActionDescriptor::error(format!("Unknown system command: {other}")),
        };
        ActionDescriptor::new(ActionKind::System, shell, message)
    }

    fn volume(&self, action: &str) -> ActionDescriptor {
        let (command, message) = match action {
            "up" => (
                format!("wpctl set-volume -l 1.0 {VOLUME_TARGET} 5%+"),
                "Increasing volume".to_string(),
            ),
            "down" => (
                format!("wpctl set-volume {VOLUME_TARGET} 5%-"),
                "Decreasing volume".to_string(),
            ),
            "mute" => (
                format!("wpctl set-mute {VOLUME_TARGET} 1"),
                "Muting audio".to_string(),
            ),
            "unmute" => (
                format!("wpctl set-mute {VOLUME_TARGET} 0"),
                "Unmuting audio".to_string(),
            ),
            level => match level.parse::<u8>() {
                Ok(percent) if percent <= 100 => (
                    format!("wpctl set-volume {VOLUME_TARGET} {percent}%"),
                    format!("Setting volume to {percent} percent"),
                ),
                _ => {
                    return ActionDescriptor::error(
                        "Please specify volume up, down, mute, or unmute",
                    )
                }
            },
        };
        ActionDescriptor::new(ActionKind::System, command, message)
    }
}

impl ActionResolver for DesktopResolver {
    fn resolve(&self, record: &IntentRecord) -> ActionDescriptor {
        let field = |name: &str| {
            record
                .field(name)
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
        };

        let action = match record.intent {
            Intent::OpenApp => match field("target") {
                Some(target) => self.open_app(&target),
                None => ActionDescriptor::error("Please tell me what to open"),
            },
            Intent::CloseApp => match field("target") {
                Some(target) => self.close_app(&target),
                None => ActionDescriptor::error("Please tell me what to close"),
            },
            Intent::Search => match field("query") {
                Some(query) => web_action(
                    "https://www.google.com/search",
                    "q",
                    &query,
                    format!("Searching for {query}"),
                ),
                None => ActionDescriptor::error("Please specify what you want to search for"),
            },
            Intent::PlayMedia => match field("media") {
                Some(media) => web_action(
                    "https://www.youtube.com/results",
                    "search_query",
                    &media,
                    format!("Playing {media}"),
                ),
                None => ActionDescriptor::error("Please specify what you want to play"),
            },
            Intent::SystemCommand => self.system_command(&field("command").unwrap_or_default()),
            Intent::Time => {
                let time = (self.clock)().format("%I:%M %p").to_string();
                let message = format!("The time is {time}");
                ActionDescriptor::new(ActionKind::Info, time, message)
            }
            Intent::Date => {
                let date = (self.clock)().format("%A, %B %d, %Y").to_string();
                let message = format!("Today is {date}");
                ActionDescriptor::new(ActionKind::Info, date, message)
            }
            Intent::Weather => ActionDescriptor::new(
                ActionKind::Web,
                "https://www.weather.com",
                "Opening weather website",
            ),
            Intent::Volume => self.volume(&field("action").unwrap_or_default()),
            Intent::Exit => ActionDescriptor::exit(),
            Intent::Unknown => ActionDescriptor::bare(
                ActionKind::Unknown,
                "I'm sorry, I didn't understand that command.",
            ),
        };

        debug!(intent = %record.intent, kind = %action.kind, payload = ?action.payload, "resolved");
        action
    }
}

fn web_action(base: &str, param: &str, value: &str, message: String) -> ActionDescriptor {
    match Url::parse_with_params(base, &[(param, value)]) {
        Ok(url) => ActionDescriptor::new(ActionKind::Web, url.as_str(), message),
        Err(e) => ActionDescriptor::error(format!("Could not build a link: {e}")),
    }
}

/// A table entry is launchable if its program is an existing path or is on
/// `PATH`.
fn is_launchable(program: &str) -> bool {
    let Some(binary) = program.split_whitespace().next() else {
        return false;
    };
    let path = Path::new(binary);
    if path.is_absolute() {
        path.exists()
    } else {
        which::which(binary).is_ok()
    }
}

/// Depth-first search for a directory named `name` (case-insensitive).
/// Hidden directories are skipped.
fn search_folder(root: &Path, name: &str, depth: usize, budget: &mut usize) -> Option<PathBuf> {
    if depth == 0 || *budget == 0 {
        return None;
    }
    *budget -= 1;

    let entries = fs::read_dir(root).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_lowercase();
        if file_name.starts_with('.') {
            continue;
        }
        if file_name == name {
            return Some(entry.path());
        }
        subdirs.push(entry.path());
    }

    subdirs.sort();
    subdirs
        .iter()
        .find_map(|dir| search_folder(dir, name, depth - 1, budget))
}
