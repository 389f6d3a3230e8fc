//! Line-oriented command console on stdin.
//!
//! Each line is one command; the answer is printed as a single JSON object
//! `{"ok": true, "result": ...}` or `{"ok": false, "error": "..."}`.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::error::ServiceError;
use crate::Surveillance;

const HELP: &str = "\
status                      service status
start [secs]                start a manual recording
stop                        stop the active recording
motion                      toggle motion detection
simulate                    simulate a motion event
set <field> <value>         change a camera setting
retention <n> <days|months> change the retention policy
cleanup                     delete expired recordings now
list                        list recordings by date
video <date/file>           details of one recording
still <date/file> <ms>      frame of a recording at an offset
frame                       latest frame metadata
quit                        stop the service";

pub struct Console {
    surveillance: Surveillance,
}

/// What a command asks the console loop to do next
#[derive(Debug, PartialEq)]
pub enum Reply {
    Print(Value),
    Quit,
}

fn ok<T: Serialize>(result: T) -> Reply {
    match serde_json::to_value(result) {
        Ok(result) => Reply::Print(json!({ "ok": true, "result": result })),
        Err(e) => failed(e),
    }
}

fn failed(error: impl std::fmt::Display) -> Reply {
    Reply::Print(json!({ "ok": false, "error": error.to_string() }))
}

impl Console {
    pub fn new(surveillance: Surveillance) -> Self {
        Console { surveillance }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), ServiceError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        log::info!("Console ready, type 'help' for commands");

        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => break,
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        log::debug!("Console input closed");
                        break;
                    };
                    match self.execute(&line).await {
                        Reply::Print(value) => println!("{}", value),
                        Reply::Quit => {
                            subsys.request_shutdown();
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn execute(&self, line: &str) -> Reply {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Reply::Print(Value::Null);
        };
        let args: Vec<&str> = words.collect();
        let s = &self.surveillance;

        match (command.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("status", []) => ok(s.status().await),
            ("start", []) => match s.start_recording(None).await {
                Ok(id) => ok(json!({ "sessionId": id })),
                Err(e) => failed(e),
            },
            ("start", [secs]) => match secs.parse::<u64>() {
                Ok(secs) => match s.start_recording(Some(Duration::from_secs(secs))).await {
                    Ok(id) => ok(json!({ "sessionId": id })),
                    Err(e) => failed(e),
                },
                Err(_) => failed(format!("Not a number of seconds: {}", secs)),
            },
            ("stop", []) => match s.stop_recording().await {
                Ok(()) => ok(s.status().await.recording),
                Err(e) => failed(e),
            },
            ("motion", []) => ok(json!({ "enabled": s.toggle_motion_detection() })),
            ("simulate", []) => match s.simulate_motion() {
                Ok(()) => ok(true),
                Err(e) => failed(e),
            },
            ("set", [field, value]) => {
                // Bare words are strings, everything else is JSON
                let value = serde_json::from_str(value).unwrap_or_else(|_| json!(value));
                match s.set_camera_setting(field, &value).await {
                    Ok(settings) => ok(settings),
                    Err(e) => failed(e),
                }
            }
            ("retention", [value, unit]) => match value.parse::<u32>() {
                Ok(value) => match s.set_retention(value, unit) {
                    Ok(policy) => ok(policy),
                    Err(e) => failed(e),
                },
                Err(_) => failed(format!("Not a number: {}", value)),
            },
            ("cleanup", []) => ok(s.trigger_cleanup().await),
            ("list", []) => ok(s.list_videos().await),
            ("video", [path]) => match s.get_video(path) {
                Ok(file) => ok(file),
                Err(e) => failed(e),
            },
            ("still", [path, at]) => match at.parse::<u64>() {
                Ok(at_ms) => match s.video_frame(path, at_ms) {
                    Ok(frame) => ok(json!({
                        "timestampMs": frame.timestamp_ms,
                        "seq": frame.seq,
                        "size": frame.data.len(),
                    })),
                    Err(e) => failed(e),
                },
                Err(_) => failed(format!("Not a number of milliseconds: {}", at)),
            },
            ("frame", []) => ok(s.latest_frame().map(|f| f.info())),
            ("help", []) => ok(HELP.lines().collect::<Vec<_>>()),
            ("quit" | "exit", []) => Reply::Quit,
            _ => failed(format!("Unknown command '{}', try 'help'", line.trim())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cli;
    use clap::Parser;
    use tempfile::TempDir;

    fn console(tmp: &TempDir, extra: &[&str]) -> Console {
        let mut argv = vec![
            "watchpost",
            "--camera",
            "synthetic",
            "--recordings-dir",
            tmp.path().to_str().unwrap(),
        ];
        argv.extend_from_slice(extra);
        let (surveillance, _services) = Surveillance::new(&Cli::parse_from(argv)).unwrap();
        Console::new(surveillance)
    }

    fn printed(reply: Reply) -> Value {
        match reply {
            Reply::Print(value) => value,
            Reply::Quit => panic!("unexpected quit"),
        }
    }

    #[tokio::test]
    async fn test_recording_commands() {
        let tmp = TempDir::new().unwrap();
        let c = console(&tmp, &[]);

        let started = printed(c.execute("start 30").await);
        assert_eq!(started["ok"], true);
        assert_eq!(started["result"]["sessionId"], 1);

        let again = printed(c.execute("start").await);
        assert_eq!(again["ok"], false);
        assert!(again["error"].as_str().unwrap().contains("Already recording"));

        let status = printed(c.execute("status").await);
        assert_eq!(status["result"]["recording"]["state"], "recording");
        assert_eq!(status["result"]["recording"]["remainingMs"], 30_000);

        let stopped = printed(c.execute("stop").await);
        assert_eq!(stopped["result"]["state"], "idle");

        let list = printed(c.execute("list").await);
        assert_eq!(list["result"].as_array().unwrap().len(), 1);
        let path = list["result"][0]["recordings"][0]["relativePath"]
            .as_str()
            .unwrap()
            .to_string();
        let video = printed(c.execute(&format!("video {}", path)).await);
        assert_eq!(video["result"]["trigger"], "manual");
        // Stopped before any frame arrived
        let still = printed(c.execute(&format!("still {} 0", path)).await);
        assert!(still["error"].as_str().unwrap().contains("no frame"));
    }

    #[tokio::test]
    async fn test_settings_and_retention_errors() {
        let tmp = TempDir::new().unwrap();
        let c = console(&tmp, &[]);

        let bad = printed(c.execute("set brightness 500").await);
        assert_eq!(bad["ok"], false);

        let retention = printed(c.execute("retention 3 months").await);
        assert_eq!(retention["result"], json!({ "unit": "months", "value": 3 }));
        assert_eq!(printed(c.execute("retention 31 days").await)["ok"], false);

        let cleanup = printed(c.execute("cleanup").await);
        assert_eq!(cleanup["result"]["deleted"], 0);
    }

    #[tokio::test]
    async fn test_motion_commands() {
        let tmp = TempDir::new().unwrap();
        let c = console(&tmp, &[]);
        assert_eq!(printed(c.execute("motion").await)["result"]["enabled"], true);
        assert_eq!(printed(c.execute("simulate").await)["ok"], true);
        assert_eq!(printed(c.execute("frame").await)["result"], Value::Null);

        let pin = tmp.path().join("pin");
        let with_pin = console(&tmp, &["--motion-pin-file", pin.to_str().unwrap()]);
        assert_eq!(printed(with_pin.execute("simulate").await)["ok"], false);
    }

    #[tokio::test]
    async fn test_unknown_and_quit() {
        let tmp = TempDir::new().unwrap();
        let c = console(&tmp, &[]);
        assert_eq!(printed(c.execute("dance").await)["ok"], false);
        assert_eq!(printed(c.execute("stop now").await)["ok"], false);
        assert_eq!(printed(c.execute("").await), Value::Null);
        assert_eq!(c.execute("quit").await, Reply::Quit);
        assert_eq!(printed(c.execute("help").await)["ok"], true);
    }
}
