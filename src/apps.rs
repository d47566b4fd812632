// Installed-application catalog and launcher
// Follows the FreeDesktop.org Desktop Entry Specification
// https://specifications.freedesktop.org/desktop-entry-spec/latest/

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use tracing::{debug, info, warn};

/// Minimum fuzzy score before a query is considered resolved.
const MIN_MATCH_SCORE: i64 = 30;

/// A desktop application parsed from a .desktop entry.
#[derive(Debug, Clone)]
pub struct DesktopApp {
    /// Desktop file id (e.g. "firefox.desktop")
    pub id: String,
    /// Display name (e.g. "Firefox Web Browser")
    pub name: String,
    /// Exec command line (e.g. "firefox %u")
    pub exec: String,
    /// Semicolon-separated keywords from the entry
    pub keywords: Vec<String>,
    /// Generic category name (e.g. "Web Browser")
    pub generic_name: String,
    /// Full path to the .desktop file
    pub path: PathBuf,
}

impl DesktopApp {
    /// Executable name from the Exec line, without path or arguments.
    pub fn binary_name(&self) -> String {
        let cleaned = strip_field_codes(&self.exec);
        let first = cleaned.split_whitespace().next().unwrap_or(&cleaned);
        first.rsplit('/').next().unwrap_or(first).to_string()
    }
}

/// Index of installed desktop applications.
pub struct AppCatalog {
    apps: Vec<DesktopApp>,
}

impl AppCatalog {
    /// Build the catalog by scanning the standard application
    /// directories.
    pub fn new() -> Self {
        let mut catalog = Self { apps: Vec::new() };
        catalog.scan();
        catalog
    }

    #[cfg(test)]
    fn with_apps(apps: Vec<DesktopApp>) -> Self {
        Self { apps }
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    fn scan(&mut self) {
        debug!("[Apps] scanning installed applications");

        let mut dirs = vec![
            PathBuf::from("/usr/share/applications"),
            PathBuf::from("/usr/local/share/applications"),
            PathBuf::from("/var/lib/snapd/desktop/applications"),
        ];
        if let Some(home) = dirs::home_dir() {
            dirs.push(home.join(".local/share/applications"));
            dirs.push(home.join(".local/share/flatpak/exports/share/applications"));
        }

        for dir in dirs {
            self.scan_directory(&dir);
        }

        info!("[Apps] found {} installed applications", self.apps.len());
    }

    fn scan_directory(&mut self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => {
                debug!("[Apps] skipping {}", dir.display());
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("desktop") {
                continue;
            }
            if let Some(app) = parse_desktop_entry(&path) {
                self.apps.push(app);
            }
        }
    }

    /// Resolve a free-form identifier to an installed application.
    ///
    /// Matches against name, desktop id, generic name, and keywords;
    /// returns `None` when the best score is below the threshold.
    pub fn resolve(&self, query: &str) -> Option<&DesktopApp> {
        if validate_app_query(query).is_err() {
            warn!("[Apps] rejecting invalid app query '{}'", query);
            return None;
        }

        let matcher = SkimMatcherV2::default();
        let query = query.to_lowercase();

        let mut best: Option<(&DesktopApp, i64)> = None;
        for app in &self.apps {
            let mut fields = vec![
                app.name.to_lowercase(),
                app.id.to_lowercase(),
                app.generic_name.to_lowercase(),
            ];
            fields.extend(app.keywords.iter().map(|k| k.to_lowercase()));

            let score = fields
                .iter()
                .filter_map(|field| matcher.fuzzy_match(field, &query))
                .max()
                .unwrap_or(0);

            if best.map_or(true, |(_, current)| score > current) {
                best = Some((app, score));
            }
        }

        match best {
            Some((app, score)) if score > MIN_MATCH_SCORE => {
                debug!(
                    "[Apps] resolved '{}' to '{}' ({}), score {}",
                    query, app.name, app.id, score
                );
                Some(app)
            }
            _ => {
                debug!("[Apps] no acceptable match for '{}'", query);
                None
            }
        }
    }
}

impl Default for AppCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one .desktop file into a catalog entry.
///
/// Hidden entries and non-application types are skipped.
fn parse_desktop_entry(path: &Path) -> Option<DesktopApp> {
    use configparser::ini::Ini;

    let mut ini = Ini::new();
    if ini.load(path.to_str()?).is_err() {
        debug!("[Apps] unparseable entry {}", path.display());
        return None;
    }

    let section = "Desktop Entry";
    if ini.get(section, "Type")? != "Application" {
        return None;
    }
    if ini.get(section, "NoDisplay").as_deref() == Some("true") {
        return None;
    }

    let exec = ini.get(section, "Exec")?;
    let name = ini.get(section, "Name")?;
    let id = path.file_name()?.to_string_lossy().to_string();
    let generic_name = ini.get(section, "GenericName").unwrap_or_default();
    let keywords = ini
        .get(section, "Keywords")
        .map(|raw| {
            raw.split(';')
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Some(DesktopApp {
        id,
        name,
        exec,
        keywords,
        generic_name,
        path: path.to_path_buf(),
    })
}

/// Validate a user-provided application identifier.
pub fn validate_app_query(query: &str) -> Result<()> {
    if query.trim().is_empty() {
        bail!("application identifier cannot be empty");
    }
    if query.len() > 256 {
        bail!(
            "application identifier is too long: {} characters (max: 256)",
            query.len()
        );
    }
    if query.contains(['/', '\\']) || query.contains("..") {
        bail!("application identifier contains invalid path characters");
    }
    Ok(())
}

/// Strip desktop-entry field codes (%u, %U, %f, %F, %i, %c, %k).
fn strip_field_codes(exec: &str) -> String {
    exec.replace("%u", "")
        .replace("%U", "")
        .replace("%f", "")
        .replace("%F", "")
        .replace("%i", "")
        .replace("%c", "")
        .replace("%k", "")
        .trim()
        .to_string()
}

/// Launch an application, trying each launcher in order until one
/// dispatches: `gio launch`, `gtk-launch`, then the raw Exec line.
pub async fn launch(app: &DesktopApp) -> bool {
    if launch_with_gio(&app.id).await {
        return true;
    }
    if launch_with_gtk(&app.id).await {
        return true;
    }
    launch_direct_exec(&app.exec).await
}

/// Launch via `gio launch` (preferred under GNOME).
async fn launch_with_gio(desktop_id: &str) -> bool {
    // spawn, never wait: the launched app outlives this call
    match tokio::process::Command::new("gio")
        .args(["launch", desktop_id])
        .spawn()
    {
        Ok(_) => {
            debug!("[Apps] launched {} via gio", desktop_id);
            true
        }
        Err(err) => {
            debug!("[Apps] gio launch unavailable for {}: {}", desktop_id, err);
            false
        }
    }
}

/// Launch via `gtk-launch` (GTK fallback).
async fn launch_with_gtk(desktop_id: &str) -> bool {
    let id = desktop_id.strip_suffix(".desktop").unwrap_or(desktop_id);

    match tokio::process::Command::new("gtk-launch").arg(id).spawn() {
        Ok(_) => {
            debug!("[Apps] launched {} via gtk-launch", id);
            true
        }
        Err(err) => {
            debug!("[Apps] gtk-launch unavailable for {}: {}", id, err);
            false
        }
    }
}

/// Launch by running the Exec line directly (last resort).
async fn launch_direct_exec(exec_line: &str) -> bool {
    let cleaned = strip_field_codes(exec_line);
    let shell_cmd = format!("nohup {cleaned} >/dev/null 2>&1 &");

    match tokio::process::Command::new("sh")
        .args(["-c", &shell_cmd])
        .spawn()
    {
        Ok(_) => {
            debug!("[Apps] launched via direct exec: {}", cleaned);
            true
        }
        Err(err) => {
            warn!("[Apps] direct exec failed for '{}': {}", cleaned, err);
            false
        }
    }
}
