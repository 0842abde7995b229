//! Terminal helpers: prompts, progress bars driven by polling the engine,
//! and the `^C` echo suppression.

use anyhow::{Result, anyhow};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use flashr_core::engine::OperationHandle;
use flashr_core::write::FlashSummary;
use flashr_core::{BlockDevice, Engine, Stage};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// On Unix, disables `ECHOCTL` so Ctrl+C is not echoed as `^C` over the
/// progress bars. The original terminal state is restored on drop.
pub struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let original_termios = Termios::from_fd(fd).ok().and_then(|original| {
                let mut quiet = original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).ok().map(|_| original)
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

pub fn select_device(devices: &[BlockDevice], prompt: &str) -> Result<BlockDevice> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

pub fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(&format!(
            "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {{msg}}",
            color
        ))?
        .progress_chars("■ "))
}

fn spinner_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_spinner()
        .template("{prefix:12} [{elapsed_precise}] {spinner:.blue} {bytes} ({bytes_per_sec}) {msg}")?
        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "))
}

fn new_bar(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style()?);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn finish<T>(pb: &ProgressBar, result: &flashr_core::Result<T>, done: &str) {
    match result {
        Ok(_) => pb.finish_with_message(done.to_string()),
        Err(e) => pb.abandon_with_message(format!("{} {}", style("✗").red(), e.kind())),
    }
}

/// Follows a download or decompression until it ends.
pub fn follow_download(
    engine: &Engine,
    handle: OperationHandle<PathBuf>,
    prefix: &str,
) -> Result<flashr_core::Result<PathBuf>> {
    let pb = new_bar(prefix)?;
    let mut sized = false;

    while !handle.is_finished() {
        let progress = engine.get_download_progress();
        if !sized && progress.percent.is_some() {
            pb.set_style(bar_style("green")?);
            pb.set_length(progress.total_bytes);
            sized = true;
        }
        pb.set_position(progress.downloaded_bytes);
        if progress.verifying_checksum {
            pb.set_message("verifying checksum");
        }
        thread::sleep(POLL_INTERVAL);
    }

    let result = handle.join();
    if let Ok(path) = &result {
        if let Ok(meta) = std::fs::metadata(path) {
            pb.set_position(meta.len().max(pb.position()));
        }
    }
    finish(&pb, &result, "done");
    Ok(result)
}

/// Follows a flash through its write and verify phases.
pub fn follow_flash(
    engine: &Engine,
    handle: OperationHandle<FlashSummary>,
) -> Result<flashr_core::Result<FlashSummary>> {
    let write_pb = ProgressBar::new(0);
    write_pb.set_style(bar_style("green")?);
    write_pb.set_prefix("Writing");
    let mut verify_pb: Option<ProgressBar> = None;

    while !handle.is_finished() {
        let progress = engine.get_flash_progress();
        match engine.current_stage() {
            Stage::Authorizing => write_pb.set_message("waiting for authorization"),
            _ => write_pb.set_message(""),
        }
        write_pb.set_length(progress.total_bytes);
        write_pb.set_position(progress.written_bytes);

        if progress.verifying {
            let pb = match verify_pb.take() {
                Some(pb) => pb,
                None => {
                    write_pb.finish_with_message("written");
                    let pb = ProgressBar::new(progress.total_bytes);
                    pb.set_style(bar_style("magenta")?);
                    pb.set_prefix("Verifying");
                    pb
                }
            };
            pb.set_position(progress.verified_bytes);
            verify_pb = Some(pb);
        }
        thread::sleep(POLL_INTERVAL);
    }

    let result = handle.join();
    let progress = engine.get_flash_progress();
    match &verify_pb {
        Some(pb) => {
            pb.set_position(progress.verified_bytes);
            finish(pb, &result, "verified");
        }
        None => {
            write_pb.set_position(progress.written_bytes);
            finish(&write_pb, &result, "done");
        }
    }
    Ok(result)
}
