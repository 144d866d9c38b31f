use std::path::Path;

/// Last-resort recursive delete through the OS shell, used when
/// `remove_dir_all` keeps failing (locked files on Windows, odd permissions).
pub async fn force_remove_dir<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return false;
    }

    #[cfg(target_os = "windows")]
    let status = tokio::process::Command::new("cmd")
        .args(["/C", "rmdir", "/S", "/Q"])
        .arg(path)
        .status()
        .await;

    #[cfg(not(target_os = "windows"))]
    let status = tokio::process::Command::new("rm")
        .arg("-rf")
        .arg(path)
        .status()
        .await;

    matches!(status, Ok(s) if s.success()) && !path.exists()
}
