use std::path::Path;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::{fs, io::AsyncWriteExt as _};

use crate::error::Result;

/// Hostname this tool runs on, as recorded in backup metadata.
pub fn hostname() -> String {
	gethostname::gethostname().to_string_lossy().into_owned()
}

/// A byte-throughput progress bar attached to the shared display.
pub fn data_bar(progress: &MultiProgress, len: u64) -> ProgressBar {
	progress.add(ProgressBar::new(len).with_style(
		ProgressStyle::default_bar()
			.template("[{bar:20.cyan/blue}] {wide_msg} {bytes}/{total_bytes} [{bytes_per_sec}] ({eta})")
			.expect("data bar template invalid")
	))
}

/// Write a file atomically: write to a temporary sibling, fsync, rename.
///
/// The rename is atomic on POSIX filesystems, so readers either see the old
/// content or the new content, never a partial write.
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
	let dir = path.parent().unwrap_or_else(|| Path::new("."));
	fs::create_dir_all(dir).await?;

	let tmp = dir.join(format!(
		".{}.tmp",
		path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
	));
	let mut file = fs::File::create(&tmp).await?;
	file.write_all(contents).await?;
	file.sync_all().await?;
	drop(file);

	fs::rename(&tmp, path).await?;
	Ok(())
}

/// Escape a ClickHouse identifier for interpolation into a statement.
pub fn quote_ident(name: &str) -> String {
	format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

/// Escape a string literal for interpolation into a statement.
pub fn quote_str(value: &str) -> String {
	format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn idents_and_strings_are_escaped() {
		assert_eq!(quote_ident("plain"), "`plain`");
		assert_eq!(quote_ident("we`ird"), "`we\\`ird`");
		assert_eq!(quote_str("all_1_1_0"), "'all_1_1_0'");
		assert_eq!(quote_str("o'clock"), "'o\\'clock'");
	}

	#[tokio::test]
	async fn atomic_write_replaces_content() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("state.json");

		atomic_write(&path, b"one").await.unwrap();
		assert_eq!(std::fs::read(&path).unwrap(), b"one");

		atomic_write(&path, b"two").await.unwrap();
		assert_eq!(std::fs::read(&path).unwrap(), b"two");
	}
}
