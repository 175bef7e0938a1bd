//! Progress event stream and the console reporter.
//!
//! Producers (transports, engines) report through a callback per event;
//! the callback's return value is an abort request which producers honor
//! at the next event boundary. The console reporter runs the actual
//! output on its own ticker thread, fed through a channel, so slow
//! terminals never stall a transfer.

use std::collections::VecDeque;
use std::io::Write;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use lob_tools::format_bytes;

/// Tick interval of the console reporter.
const TICK: Duration = Duration::from_millis(500);

/// Sliding window length for the transfer rate, in ticks.
const RATE_SAMPLES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressKind {
    /// Analysis work before any transfer.
    Calculate,
    /// Bytes moved for one item; emitted repeatedly while it transfers.
    TransferBytes,
    /// Item skipped because the destination is already up to date.
    Skip,
    /// Item does not exist at the source; not fatal for downloads.
    NotFound,
    /// Item failed; details in the description.
    Error,
    /// Prune kept an item because something still references it.
    RetainReferenced,
    /// Prune kept an item because it is within the retention window.
    RetainByDate,
    /// Prune kept an item because it is not known to be pushed.
    RetainNotPushed,
    /// Prune removed an item.
    Deleted,
    /// Periodic liveness signal while scanning.
    Working,
}

#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub desc: String,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub overall_done: u64,
    pub overall_total: u64,
}

impl ProgressEvent {
    /// An event without byte counts.
    pub fn note(kind: ProgressKind, desc: impl Into<String>) -> Self {
        ProgressEvent {
            kind,
            desc: desc.into(),
            bytes_done: 0,
            bytes_total: 0,
            overall_done: 0,
            overall_total: 0,
        }
    }

    pub fn transfer(
        desc: impl Into<String>,
        bytes_done: u64,
        bytes_total: u64,
        overall_done: u64,
        overall_total: u64,
    ) -> Self {
        ProgressEvent {
            kind: ProgressKind::TransferBytes,
            desc: desc.into(),
            bytes_done,
            bytes_total,
            overall_done,
            overall_total,
        }
    }
}

/// Progress callback; returning `true` requests an abort.
pub type ProgressFn<'a> = &'a mut dyn FnMut(&ProgressEvent) -> bool;

/// A callback that ignores all events and never aborts.
pub fn discard() -> impl FnMut(&ProgressEvent) -> bool {
    |_event| false
}

/// Console reporter with an overwrite-in-place status line.
///
/// Events go through a channel to a ticker thread. On each tick the
/// thread drains everything pending, collapses repeated
/// `TransferBytes` events per item down to the last one, prints the
/// notable events, and redraws the status line with a sliding-window
/// transfer rate and ETA.
pub struct ConsoleReporter {
    sender: Option<Sender<ProgressEvent>>,
    ticker: Option<JoinHandle<()>>,
}

impl ConsoleReporter {
    pub fn start(verbose: bool) -> Self {
        let (sender, receiver) = unbounded();
        let ticker = std::thread::Builder::new()
            .name("progress".to_string())
            .spawn(move || ticker_loop(receiver, verbose))
            .unwrap();
        ConsoleReporter {
            sender: Some(sender),
            ticker: Some(ticker),
        }
    }

    /// A producer-side callback feeding this reporter. Never aborts.
    pub fn callback(&self) -> impl FnMut(&ProgressEvent) -> bool {
        let sender = self.sender.clone().unwrap();
        move |event| {
            let _ = sender.send(event.clone());
            false
        }
    }

    /// Close the channel and wait for the final flush.
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.sender.take());
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
    }
}

impl Drop for ConsoleReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ticker_loop(receiver: Receiver<ProgressEvent>, verbose: bool) {
    let started = Instant::now();
    let ticker = crossbeam_channel::tick(TICK);

    let mut pending: Vec<ProgressEvent> = Vec::new();
    let mut rate = RateWindow::new(RATE_SAMPLES);
    let mut line = StatusLine::new();

    loop {
        crossbeam_channel::select! {
            recv(receiver) -> event => match event {
                Ok(event) => pending.push(event),
                Err(_) => break,
            },
            recv(ticker) -> _ => {
                flush_tick(&mut pending, verbose, &mut line, &mut rate, started.elapsed().as_secs_f64());
            }
        }
    }

    flush_tick(&mut pending, verbose, &mut line, &mut rate, started.elapsed().as_secs_f64());
    line.close();
}

fn flush_tick(
    pending: &mut Vec<ProgressEvent>,
    verbose: bool,
    line: &mut StatusLine,
    rate: &mut RateWindow,
    elapsed: f64,
) {
    let mut transfers: Vec<ProgressEvent> = Vec::new();
    let mut working: Option<ProgressEvent> = None;

    for event in pending.drain(..) {
        match event.kind {
            ProgressKind::TransferBytes => {
                match transfers.iter_mut().find(|t| t.desc == event.desc) {
                    Some(slot) => *slot = event,
                    None => transfers.push(event),
                }
            }
            ProgressKind::Working => working = Some(event),
            ProgressKind::Calculate => line.note(&event.desc),
            ProgressKind::NotFound => line.note(&format!("not found: {}", event.desc)),
            ProgressKind::Error => line.note(&format!("error: {}", event.desc)),
            ProgressKind::Deleted => line.note(&format!("deleted {}", event.desc)),
            ProgressKind::Skip => {
                if verbose {
                    line.note(&format!("skipped {} (up to date)", event.desc));
                }
            }
            ProgressKind::RetainReferenced
            | ProgressKind::RetainByDate
            | ProgressKind::RetainNotPushed => {
                if verbose {
                    let reason = match event.kind {
                        ProgressKind::RetainReferenced => "still referenced",
                        ProgressKind::RetainByDate => "within retention window",
                        _ => "not pushed",
                    };
                    line.note(&format!("retained {} ({})", event.desc, reason));
                }
            }
        }
    }

    if let Some(last) = transfers.last() {
        rate.push(elapsed, last.overall_done);
        line.status(&render_transfer(last, rate.rate()));
    } else if let Some(event) = working {
        line.status(&event.desc);
    }
}

fn render_transfer(event: &ProgressEvent, rate: Option<f64>) -> String {
    let mut out = format!(
        "{}: {}/{}",
        event.desc,
        format_bytes(event.bytes_done),
        format_bytes(event.bytes_total),
    );

    if event.overall_total > 0 {
        let percent = event.overall_done as f64 * 100.0 / event.overall_total as f64;
        out.push_str(&format!(
            "  overall {:.0}% ({}/{})",
            percent,
            format_bytes(event.overall_done),
            format_bytes(event.overall_total),
        ));
    }

    if let Some(rate) = rate {
        if rate > 0.0 {
            out.push_str(&format!("  {}/s", format_bytes(rate as u64)));
            let remaining = event.overall_total.saturating_sub(event.overall_done);
            let eta = (remaining as f64 / rate).ceil() as u64;
            out.push_str(&format!("  ETA {}s", eta));
        }
    }

    out
}

/// Sliding window over (elapsed seconds, overall bytes) samples.
struct RateWindow {
    samples: VecDeque<(f64, u64)>,
    capacity: usize,
}

impl RateWindow {
    fn new(capacity: usize) -> Self {
        RateWindow {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    fn push(&mut self, elapsed: f64, bytes: u64) {
        self.samples.push_back((elapsed, bytes));
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Average bytes per second over the window.
    fn rate(&self) -> Option<f64> {
        let (first_t, first_b) = *self.samples.front()?;
        let (last_t, last_b) = *self.samples.back()?;
        let dt = last_t - first_t;
        if dt <= 0.0 || last_b < first_b {
            return None;
        }
        Some((last_b - first_b) as f64 / dt)
    }
}

/// One overwritable console line plus interleaved notes.
struct StatusLine {
    width: usize,
}

impl StatusLine {
    fn new() -> Self {
        StatusLine { width: 0 }
    }

    fn clear(&mut self) {
        if self.width > 0 {
            print!("\r{:width$}\r", "", width = self.width);
            self.width = 0;
        }
    }

    /// Print a full line above the status line.
    fn note(&mut self, text: &str) {
        self.clear();
        println!("{}", text);
        let _ = std::io::stdout().flush();
    }

    /// Redraw the status line in place, right-padded so leftovers of a
    /// longer previous line are wiped.
    fn status(&mut self, text: &str) {
        let pad = self.width.saturating_sub(text.len());
        print!("\r{}{:pad$}", text, "", pad = pad);
        let _ = std::io::stdout().flush();
        self.width = text.len();
    }

    fn close(&mut self) {
        if self.width > 0 {
            println!();
            let _ = std::io::stdout().flush();
            self.width = 0;
        }
    }
}
