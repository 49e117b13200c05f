//! Application inventory and process control
//!
//! The agent reports installed applications (desktop entries) and running
//! processes (procfs), launches commands, and terminates pids. Entry
//! parsing is deliberately shallow: the fields the client renders
//! (name/icon/exec/keywords), nothing more.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, warn};

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Default)]
pub struct AppEntry {
    pub id: String,
    pub name: String,
    pub icon: String,
    pub exec: String,
    pub keywords: String,
    pub pid: u32,
}

pub trait AppManager: Send + Sync {
    fn list_installed(&self) -> Vec<AppEntry>;
    fn list_processes(&self) -> Vec<AppEntry>;
    fn launch(&self, command: &str) -> Result<u32>;
    fn kill(&self, pid: u32) -> Result<()>;
    fn search(&self, query: &str) -> Vec<AppEntry>;
    fn shutdown_system(&self) -> Result<()>;
    fn restart_system(&self) -> Result<()>;
}

/// procfs + desktop-entry backed implementation.
pub struct SystemAppManager {
    applications_dir: PathBuf,
}

impl SystemAppManager {
    pub fn new() -> Self {
        SystemAppManager {
            applications_dir: PathBuf::from("/usr/share/applications"),
        }
    }

    pub fn with_applications_dir(dir: PathBuf) -> Self {
        SystemAppManager {
            applications_dir: dir,
        }
    }

    fn parse_desktop_entry(&self, path: &std::path::Path) -> Option<AppEntry> {
        let content = fs::read_to_string(path).ok()?;
        let id = path.file_stem()?.to_string_lossy().into_owned();

        let mut entry = AppEntry {
            id,
            ..Default::default()
        };

        for line in content.lines() {
            if let Some(value) = line.strip_prefix("Name=") {
                if entry.name.is_empty() {
                    entry.name = value.to_string();
                }
            } else if let Some(value) = line.strip_prefix("Exec=") {
                if entry.exec.is_empty() {
                    entry.exec = value.to_string();
                }
            } else if let Some(value) = line.strip_prefix("Icon=") {
                if entry.icon.is_empty() {
                    entry.icon = value.to_string();
                }
            } else if let Some(value) = line.strip_prefix("Keywords=") {
                if entry.keywords.is_empty() {
                    entry.keywords = value.to_string();
                }
            } else if line == "NoDisplay=true" || line == "Hidden=true" {
                return None;
            }
        }

        if entry.name.is_empty() {
            return None;
        }
        Some(entry)
    }
}

impl Default for SystemAppManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AppManager for SystemAppManager {
    fn list_installed(&self) -> Vec<AppEntry> {
        let dir = match fs::read_dir(&self.applications_dir) {
            Ok(dir) => dir,
            Err(e) => {
                debug!(error = %e, "no desktop entry directory");
                return Vec::new();
            }
        };

        let mut apps: Vec<AppEntry> = dir
            .flatten()
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "desktop"))
            .filter_map(|e| self.parse_desktop_entry(&e.path()))
            .collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        apps
    }

    fn list_processes(&self) -> Vec<AppEntry> {
        let dir = match fs::read_dir("/proc") {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "cannot read procfs");
                return Vec::new();
            }
        };

        let mut procs = Vec::new();
        for entry in dir.flatten() {
            let name = entry.file_name();
            let pid: u32 = match name.to_string_lossy().parse() {
                Ok(pid) => pid,
                Err(_) => continue,
            };

            let comm = fs::read_to_string(entry.path().join("comm"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            if comm.is_empty() {
                continue;
            }

            let exec = fs::read(entry.path().join("cmdline"))
                .map(|raw| {
                    raw.split(|&b| b == 0)
                        .next()
                        .map(|arg0| String::from_utf8_lossy(arg0).into_owned())
                        .unwrap_or_default()
                })
                .unwrap_or_default();

            procs.push(AppEntry {
                id: pid.to_string(),
                name: comm,
                exec,
                pid,
                ..Default::default()
            });
        }
        procs.sort_by_key(|p| p.pid);
        procs
    }

    fn launch(&self, command: &str) -> Result<u32> {
        if command.trim().is_empty() {
            return Err(AgentError::Fatal("empty launch command".to_string()));
        }

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .spawn()
            .map_err(|e| AgentError::Fatal(format!("spawn failed: {e}")))?;

        let pid = child.id();
        debug!(pid, command, "application launched");
        Ok(pid)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        // Unconditional SIGKILL: targets must not be able to ignore it.
        let status = Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .status()
            .map_err(|e| AgentError::Fatal(format!("kill failed: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(AgentError::Fatal(format!("kill exited with {status}")))
        }
    }

    fn search(&self, query: &str) -> Vec<AppEntry> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.list_installed();
        }

        // Name-prefix hits rank before name-substring hits, which rank
        // before id/keyword hits.
        let mut scored: Vec<(u8, AppEntry)> = self
            .list_installed()
            .into_iter()
            .filter_map(|app| {
                let name = app.name.to_lowercase();
                if name.starts_with(&needle) {
                    Some((0, app))
                } else if name.contains(&needle) {
                    Some((1, app))
                } else if app.id.to_lowercase().contains(&needle)
                    || app.keywords.to_lowercase().contains(&needle)
                {
                    Some((2, app))
                } else {
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        scored.into_iter().map(|(_, app)| app).collect()
    }

    fn shutdown_system(&self) -> Result<()> {
        Command::new("systemctl")
            .arg("poweroff")
            .spawn()
            .map_err(|e| AgentError::PermissionDenied(format!("poweroff failed: {e}")))?;
        Ok(())
    }

    fn restart_system(&self) -> Result<()> {
        Command::new("systemctl")
            .arg("reboot")
            .spawn()
            .map_err(|e| AgentError::PermissionDenied(format!("reboot failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_entries(entries: &[(&str, &str)]) -> (tempfile::TempDir, SystemAppManager) {
        let dir = tempfile::tempdir().unwrap();
        for (file, content) in entries {
            std::fs::write(dir.path().join(file), content).unwrap();
        }
        let manager = SystemAppManager::with_applications_dir(dir.path().to_path_buf());
        (dir, manager)
    }

    #[test]
    fn test_desktop_entries_parsed() {
        let (_dir, manager) = manager_with_entries(&[
            (
                "firefox.desktop",
                "[Desktop Entry]\nName=Firefox\nExec=firefox %u\nIcon=firefox\nKeywords=web;browser;\n",
            ),
            (
                "hidden.desktop",
                "[Desktop Entry]\nName=Hidden\nExec=hidden\nNoDisplay=true\n",
            ),
            ("notes.txt", "not a desktop file"),
        ]);

        let apps = manager.list_installed();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].id, "firefox");
        assert_eq!(apps[0].name, "Firefox");
        assert_eq!(apps[0].exec, "firefox %u");
        assert_eq!(apps[0].keywords, "web;browser;");
    }

    #[test]
    fn test_search_ranks_prefix_first() {
        let (_dir, manager) = manager_with_entries(&[
            (
                "gedit.desktop",
                "[Desktop Entry]\nName=Text Editor\nExec=gedit\nKeywords=edit;text;\n",
            ),
            (
                "editor.desktop",
                "[Desktop Entry]\nName=Editron\nExec=editron\n",
            ),
        ]);

        let hits = manager.search("edit");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].name, "Editron", "name prefix ranks first");
        assert_eq!(hits[1].name, "Text Editor");
    }

    #[test]
    fn test_search_empty_query_lists_all() {
        let (_dir, manager) = manager_with_entries(&[(
            "a.desktop",
            "[Desktop Entry]\nName=A\nExec=a\n",
        )]);
        assert_eq!(manager.search("  ").len(), 1);
    }

    #[test]
    fn test_launch_and_kill() {
        let manager = SystemAppManager::new();
        let pid = manager.launch("sleep 30").unwrap();
        assert!(pid > 0);
        manager.kill(pid).unwrap();
    }

    #[test]
    fn test_launch_empty_command_rejected() {
        let manager = SystemAppManager::new();
        assert!(manager.launch("   ").is_err());
    }

    #[test]
    fn test_list_processes_contains_self() {
        let manager = SystemAppManager::new();
        let me = std::process::id();
        let procs = manager.list_processes();
        assert!(procs.iter().any(|p| p.pid == me));
    }
}
