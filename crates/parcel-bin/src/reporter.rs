use std::{fmt::Write, time::Duration};

use indicatif::{
    style::TemplateError, HumanBytes, MultiProgress, ProgressBar, ProgressState, ProgressStyle,
};
use parcel::{PackageRef, Reporter, Sha256Hash};
use parking_lot::Mutex;

fn default_bytes_style() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:20!} [{elapsed_precise}] [{bar:40!.bright.yellow/dim.white}] {bytes:>8} @ {smoothed_bytes_per_sec:8}")?
        .progress_chars("━━╾─")
        .with_key(
            "smoothed_bytes_per_sec",
            |s: &ProgressState, w: &mut dyn Write| match (s.pos(), s.elapsed().as_millis()) {
                (pos, elapsed_ms) if elapsed_ms > 0 => {
                    _ = write!(w, "{}/s", HumanBytes((pos as f64 * 1000_f64 / elapsed_ms as f64) as u64));
                }
                _ => {
                    _ = write!(w, "-");
                }
            },
        ))
}

/// A [`Reporter`] that draws byte based progress bars.
pub struct IndicatifReporter {
    multi_progress: MultiProgress,
    style: ProgressStyle,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    upload: Option<ProgressBar>,
    downloads: Vec<ProgressBar>,
}

impl IndicatifReporter {
    pub fn new(multi_progress: MultiProgress) -> Result<Self, TemplateError> {
        Ok(Self {
            multi_progress,
            style: default_bytes_style()?,
            state: Mutex::default(),
        })
    }

    fn bar(&self, len: Option<u64>, prefix: String) -> ProgressBar {
        let bar = self.multi_progress.add(match len {
            Some(len) => ProgressBar::new(len),
            None => ProgressBar::no_length(),
        });
        bar.set_style(self.style.clone());
        bar.set_prefix(prefix);
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    }
}

fn short_hash(hash: &Sha256Hash) -> String {
    format!("{hash:x}")[..12].to_string()
}

impl Reporter for IndicatifReporter {
    fn on_push_start(&self, package: &PackageRef, _objects: usize, total_bytes: u64) {
        let bar = self.bar(Some(total_bytes), format!("Pushing {package}"));
        self.state.lock().upload = Some(bar);
    }

    fn on_upload_progress(&self, uploaded: u64, _total_bytes: u64) {
        if let Some(bar) = &self.state.lock().upload {
            bar.set_position(uploaded);
        }
    }

    fn on_object_skipped(&self, _hash: &Sha256Hash) {}

    fn on_object_uploaded(&self, _hash: &Sha256Hash) {}

    fn on_object_failed(&self, hash: &Sha256Hash, error: &(dyn std::error::Error + 'static)) {
        self.multi_progress
            .suspend(|| eprintln!("{} {hash:x}: {error}", console::style("failed").red()));
    }

    fn on_push_complete(&self, _package: &PackageRef, _hash: &Sha256Hash) {
        if let Some(bar) = self.state.lock().upload.take() {
            bar.finish_and_clear();
        }
    }

    fn on_install_start(&self, _package: &PackageRef, _objects: usize) {}

    fn on_object_reused(&self, _hash: &Sha256Hash) {}

    fn on_download_start(&self, hash: &Sha256Hash) -> usize {
        let bar = self.bar(None, format!("Downloading {}", short_hash(hash)));
        let mut state = self.state.lock();
        state.downloads.push(bar);
        state.downloads.len() - 1
    }

    fn on_download_progress(&self, index: usize, progress: u64, total: Option<u64>) {
        if let Some(bar) = self.state.lock().downloads.get(index) {
            if let Some(total) = total {
                bar.set_length(total);
            }
            bar.set_position(progress);
        }
    }

    fn on_download_complete(&self, index: usize) {
        if let Some(bar) = self.state.lock().downloads.get(index) {
            bar.finish_and_clear();
        }
    }

    fn on_install_complete(&self, _package: &PackageRef, _hash: &Sha256Hash) {
        for bar in self.state.lock().downloads.drain(..) {
            bar.finish_and_clear();
        }
    }
}
