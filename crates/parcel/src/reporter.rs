use parcel_digest::Sha256Hash;
use parcel_tree::PackageRef;

/// A trait for reporting progress of pushes and installs.
///
/// Upload progress is always expressed in uncompressed bytes, even though
/// objects travel gzip compressed.
pub trait Reporter: Send + Sync {
    /// Called once the objects of a push are known.
    fn on_push_start(&self, package: &PackageRef, objects: usize, total_bytes: u64);

    /// Called whenever the number of uploaded bytes grows. `uploaded` is the
    /// total for the whole push so far.
    fn on_upload_progress(&self, uploaded: u64, total_bytes: u64);

    /// Called when an object does not need to be uploaded because the registry
    /// already stores it.
    fn on_object_skipped(&self, hash: &Sha256Hash);

    /// Called when an object was uploaded.
    fn on_object_uploaded(&self, hash: &Sha256Hash);

    /// Called when an object could not be uploaded, even after retrying.
    fn on_object_failed(&self, hash: &Sha256Hash, error: &(dyn std::error::Error + 'static));

    /// Called when the tree was pushed and the latest tag points at it.
    fn on_push_complete(&self, package: &PackageRef, hash: &Sha256Hash);

    /// Called once the objects of an install are known.
    fn on_install_start(&self, package: &PackageRef, objects: usize);

    /// Called when a local object was verified and does not need a download.
    fn on_object_reused(&self, hash: &Sha256Hash);

    /// Called when a download starts. The returned index identifies the
    /// download in later calls.
    fn on_download_start(&self, hash: &Sha256Hash) -> usize;

    /// Called with regular updates on the download progress. `progress`
    /// includes bytes staged by an earlier, interrupted attempt.
    fn on_download_progress(&self, index: usize, progress: u64, total: Option<u64>);

    /// Called when a downloaded object was verified and committed.
    fn on_download_complete(&self, index: usize);

    /// Called when the package record was written.
    fn on_install_complete(&self, package: &PackageRef, hash: &Sha256Hash);
}
