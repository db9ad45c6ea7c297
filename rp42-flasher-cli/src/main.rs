//! Interactive flash uploader for the RP42 calculator.
//!
//! No flags, no arguments: the whole surface is console prompts, since the
//! operator has to physically reconnect the target between phases anyway.
//! Phase order is fixed: erase, reset checkpoint, tail write, pause
//! checkpoint, head write. Any serial failure mid-phase is fatal; there is
//! no way to detect or resume a partial write, so a failed run is restarted
//! from the erase phase.

use std::{io::ErrorKind, thread};

use futures::StreamExt;
use rp42_flasher::{Status, stm32};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .expect("Failed to register tracing_subscriber");

    let term = console::Term::stdout();
    term.write_line("Flash loader 2.0\n").unwrap();

    let path = prompt(&term, "Enter file to load to flash: ");
    let firmware = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            term.write_line("File not found").unwrap();
            return;
        }
        Err(e) => panic!("Failed to read {path}: {e}"),
    };
    term.write_line(&format!("{} bytes to write", firmware.len()))
        .unwrap();

    let port = prompt_port(&term, "Enter the port name: ");
    run_phase(|chan| stm32::erase(&port, chan)).expect("Failed to erase chip");

    prompt(
        &term,
        "Please reset the calculator. Then press enter to continue",
    );

    // The target may enumerate on a different port after the reset.
    let port = prompt_port(&term, "Input new port: ");
    run_phase(|chan| stm32::write_tail(&firmware, &port, chan))
        .expect("Failed to write tail region");

    let port = prompt(&term, "Upload paused. Enter port once ready to continue: ");
    run_phase(|chan| stm32::write_head(&firmware, &port, chan))
        .expect("Failed to write head region");
}

/// Runs one serial phase with a printer thread draining its progress
/// channel. The phase owns the sender, so the printer sees the channel close
/// and exits before the next operator prompt is shown.
fn run_phase<F>(phase: F) -> Result<(), stm32::Error>
where
    F: FnOnce(Option<futures::channel::mpsc::Sender<Status>>) -> Result<(), stm32::Error>,
{
    let (tx, mut rx) = futures::channel::mpsc::channel(20);

    let printer = thread::spawn(move || {
        futures::executor::block_on(async move {
            let term = console::Term::stdout();
            while let Some(status) = rx.next().await {
                let line = match status {
                    Status::Erasing(p) => format!("Erasing chip: {:.0}%", p * 100.0),
                    Status::Writing(p) => format!("Writing program: {:.1}%", p * 100.0),
                };
                term.write_line(&line).unwrap();
            }
        })
    });

    let res = phase(Some(tx));
    printer.join().unwrap();
    res
}

fn prompt(term: &console::Term, msg: &str) -> String {
    term.write_str(msg).unwrap();
    term.read_line().unwrap().trim().to_string()
}

fn prompt_port(term: &console::Term, msg: &str) -> String {
    term.write_line("\nAvailable Ports:").unwrap();
    for port in stm32::ports() {
        term.write_line(&format!("\t{port}")).unwrap();
    }
    prompt(term, msg)
}
