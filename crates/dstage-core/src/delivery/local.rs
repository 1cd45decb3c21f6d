//! Bundled in-process delivery: local file copies and HTTP(S) via libcurl.
//!
//! Downloads are written to `<dest>.part` and renamed into place only after
//! the last byte, so a cancelled or failed transfer never touches the
//! destination itself.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{DataDelivery, Resolution, TransferControl, TransferTask};
use crate::dtr::DeliveryEndpoint;
use crate::retry::{classify_curl_error, classify_http_status, DtrError, ErrorKind, ErrorPhase};
use crate::url_model::Locator;

const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LocalDelivery {
    pub connect_timeout: Duration,
    pub head_timeout: Duration,
}

impl Default for LocalDelivery {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            head_timeout: Duration::from_secs(60),
        }
    }
}

fn is_http(loc: &Locator) -> bool {
    matches!(loc.scheme().to_ascii_lowercase().as_str(), "http" | "https")
}

fn unsupported(loc: &Locator) -> DtrError {
    DtrError::new(
        ErrorKind::Other,
        format!("unsupported protocol for in-process delivery: {}", loc.scheme()),
    )
}

fn curl_err(e: curl::Error) -> DtrError {
    DtrError::new(classify_curl_error(&e), e.to_string())
}

fn http_status(url: &str, code: u32) -> Result<(), DtrError> {
    if (200..300).contains(&code) {
        return Ok(());
    }
    Err(DtrError::new(
        classify_http_status(code),
        format!("{} returned HTTP {}", url, code),
    ))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

impl LocalDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    fn easy(&self, url: &str, task: &TransferTask) -> Result<curl::easy::Easy, DtrError> {
        let mut easy = curl::easy::Easy::new();
        easy.url(url)
            .map_err(|e| DtrError::new(ErrorKind::InvalidRequest, e.to_string()))?;
        easy.follow_location(true).map_err(curl_err)?;
        easy.max_redirections(10).map_err(curl_err)?;
        easy.connect_timeout(self.connect_timeout).map_err(curl_err)?;
        if let Some(cred) = &task.credential {
            // Proxy files carry certificate and key together.
            easy.ssl_cert(cred).map_err(curl_err)?;
            easy.ssl_key(cred).map_err(curl_err)?;
        }
        Ok(easy)
    }

    fn head(&self, task: &TransferTask) -> Result<Resolution, DtrError> {
        let url = task.source.base();
        let mut easy = self.easy(url, task)?;
        easy.nobody(true).map_err(curl_err)?;
        easy.timeout(self.head_timeout).map_err(curl_err)?;
        easy.perform().map_err(curl_err)?;
        let code = easy.response_code().map_err(curl_err)?;
        http_status(url, code)?;
        let len = easy.content_length_download().map_err(curl_err)?;
        Ok(Resolution {
            size: (len >= 0.0).then_some(len as u64),
        })
    }

    fn copy_blocks(
        &self,
        mut reader: impl Read,
        writer: &mut File,
        control: &TransferControl,
    ) -> Result<(), DtrError> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        loop {
            control.checkpoint()?;
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            writer.write_all(&buf[..n])?;
            control.report_bytes(n as u64);
        }
    }

    fn http_get(
        &self,
        task: &TransferTask,
        writer: &mut File,
        control: &TransferControl,
    ) -> Result<(), DtrError> {
        let url = task.source.base();
        let mut easy = self.easy(url, task)?;
        easy.progress(true).map_err(curl_err)?;
        let mut write_error: Option<io::Error> = None;
        let performed = {
            let mut transfer = easy.transfer();
            transfer
                .write_function(|data| {
                    if control.should_abort() {
                        return Ok(0);
                    }
                    match writer.write_all(data) {
                        Ok(()) => {
                            control.report_bytes(data.len() as u64);
                            Ok(data.len())
                        }
                        Err(e) => {
                            write_error = Some(e);
                            Ok(0)
                        }
                    }
                })
                .map_err(curl_err)?;
            transfer
                .progress_function(|_, _, _, _| !control.should_abort())
                .map_err(curl_err)?;
            transfer.perform()
        };
        control.checkpoint()?;
        if let Some(e) = write_error {
            return Err(e.into());
        }
        performed.map_err(curl_err)?;
        let code = easy.response_code().map_err(curl_err)?;
        http_status(url, code)
    }

    fn http_put(&self, task: &TransferTask, control: &TransferControl) -> Result<(), DtrError> {
        let path = task
            .source
            .local_path()
            .ok_or_else(|| DtrError::new(ErrorKind::InvalidRequest, "upload source is not local"))?;
        let mut file = File::open(&path)?;
        let size = file.metadata()?.len();
        let url = task.destination.base();
        let mut easy = self.easy(url, task)?;
        easy.upload(true).map_err(curl_err)?;
        easy.in_filesize(size).map_err(curl_err)?;
        easy.progress(true).map_err(curl_err)?;
        let performed = {
            let mut transfer = easy.transfer();
            transfer
                .read_function(|buf| {
                    if control.should_abort() {
                        return Err(curl::easy::ReadError::Abort);
                    }
                    match file.read(buf) {
                        Ok(n) => {
                            control.report_bytes(n as u64);
                            Ok(n)
                        }
                        Err(_) => Err(curl::easy::ReadError::Abort),
                    }
                })
                .map_err(curl_err)?;
            transfer
                .progress_function(|_, _, _, _| !control.should_abort())
                .map_err(curl_err)?;
            transfer.perform()
        };
        control.checkpoint()?;
        performed.map_err(curl_err)?;
        let code = easy.response_code().map_err(curl_err)?;
        http_status(url, code)
    }

    fn resolve_source(&self, task: &TransferTask) -> Result<Resolution, DtrError> {
        match task.source.local_path() {
            Some(path) => {
                let meta = fs::metadata(&path)?;
                if !meta.is_file() {
                    return Err(DtrError::new(
                        ErrorKind::InvalidRequest,
                        format!("source is not a regular file: {}", path.display()),
                    ));
                }
                Ok(Resolution {
                    size: Some(meta.len()),
                })
            }
            None if is_http(&task.source) => self.head(task),
            None => Err(unsupported(&task.source)),
        }
    }

    fn download(&self, task: &TransferTask, control: &TransferControl) -> Result<(), DtrError> {
        let dest = task.destination.local_path().ok_or_else(|| {
            DtrError::new(ErrorKind::InvalidRequest, "download destination is not local")
        })?;
        if dest.exists() && !task.destination.overwrite() {
            return Err(DtrError::new(
                ErrorKind::DestinationExists,
                format!("destination already exists: {}", dest.display()),
            ));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let part = part_path(&dest);
        let mut out = File::create(&part)?;

        let result = match task.source.local_path() {
            Some(src) => File::open(&src)
                .map_err(DtrError::from)
                .and_then(|f| self.copy_blocks(f, &mut out, control)),
            None if is_http(&task.source) => self.http_get(task, &mut out, control),
            None => Err(unsupported(&task.source)),
        };
        let result = result.and_then(|()| {
            let written = control.bytes();
            match task.expected_size {
                Some(expected) if expected != written => Err(DtrError::new(
                    ErrorKind::Integrity,
                    format!("size mismatch: wrote {} of {} bytes", written, expected),
                )),
                _ => Ok(()),
            }
        });
        let result = result.and_then(|()| {
            out.sync_all()?;
            fs::rename(&part, &dest)?;
            Ok(())
        });
        if result.is_err() {
            let _ = fs::remove_file(&part);
        }
        result
    }
}

impl DataDelivery for LocalDelivery {
    fn resolve(&self, task: &TransferTask) -> Result<Resolution, DtrError> {
        self.resolve_source(task)
            .map_err(|e| e.in_phase(ErrorPhase::PreProcessing))
    }

    fn transfer(&self, task: &TransferTask, control: &TransferControl) -> Result<(), DtrError> {
        if let DeliveryEndpoint::Remote(service) = &task.endpoint {
            return Err(DtrError::new(
                ErrorKind::Other,
                format!("remote delivery service not reachable in-process: {}", service),
            )
            .in_phase(ErrorPhase::Transfer));
        }
        let result = if task.destination.is_local() {
            self.download(task, control)
        } else if is_http(&task.destination) {
            self.http_put(task, control)
        } else {
            Err(unsupported(&task.destination))
        };
        result.map_err(|e| e.in_phase(ErrorPhase::Transfer))
    }

    fn register(&self, task: &TransferTask) -> Result<(), DtrError> {
        let Some(dest) = task.destination.local_path() else {
            return Ok(());
        };
        let meta = fs::metadata(&dest)
            .map_err(|e| DtrError::from(e).in_phase(ErrorPhase::PostProcessing))?;
        match task.expected_size {
            Some(expected) if expected != meta.len() => Err(DtrError::new(
                ErrorKind::Integrity,
                format!("{} has {} bytes, expected {}", dest.display(), meta.len(), expected),
            )
            .in_phase(ErrorPhase::PostProcessing)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtr::Dtr;
    use crate::job::{JobId, LocalUser};

    fn task(src: &str, dest: &str) -> TransferTask {
        let mut dtr = Dtr::new(JobId::new("J1"), src, dest, LocalUser::new(1, 1, "u"));
        // Local-to-local copies only happen after URL mapping.
        if src.starts_with("file:") {
            dtr = Dtr::new(JobId::new("J1"), "gsiftp://se/x", dest, LocalUser::new(1, 1, "u"));
            dtr.mapped_source = Some(src.to_string());
        }
        TransferTask::from_dtr(&dtr).unwrap()
    }

    #[test]
    fn resolve_and_copy_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.dat");
        fs::write(&src, vec![7u8; 200_000]).unwrap();
        let dest = dir.path().join("ws/J1/a");
        let mut t = task(
            &format!("file:{}", src.display()),
            &format!("file:{}", dest.display()),
        );
        let delivery = LocalDelivery::new();
        let res = delivery.resolve(&t).unwrap();
        assert_eq!(res.size, Some(200_000));
        t.expected_size = res.size;
        let control = TransferControl::new();
        delivery.transfer(&t, &control).unwrap();
        assert_eq!(control.bytes(), 200_000);
        assert_eq!(fs::read(&dest).unwrap().len(), 200_000);
        assert!(!part_path(&dest).exists());
        delivery.register(&t).unwrap();
    }

    #[test]
    fn missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let t = task(
            &format!("file:{}", dir.path().join("nope").display()),
            &format!("file:{}", dir.path().join("out").display()),
        );
        let err = LocalDelivery::new().resolve(&t).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.phase, Some(ErrorPhase::PreProcessing));
    }

    #[test]
    fn existing_destination_needs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::write(&src, b"new").unwrap();
        let dest = dir.path().join("dest");
        fs::write(&dest, b"old").unwrap();
        let src_url = format!("file:{}", src.display());
        let delivery = LocalDelivery::new();

        let t = task(&src_url, &format!("file:{}", dest.display()));
        let err = delivery.transfer(&t, &TransferControl::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DestinationExists);
        assert_eq!(fs::read(&dest).unwrap(), b"old");

        let t = task(&src_url, &format!("file:{};overwrite=yes", dest.display()));
        delivery.transfer(&t, &TransferControl::new()).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    fn cancelled_transfer_leaves_no_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::write(&src, b"data").unwrap();
        let dest = dir.path().join("dest");
        let t = task(
            &format!("file:{}", src.display()),
            &format!("file:{}", dest.display()),
        );
        let control = TransferControl::new();
        control.cancel();
        let err = LocalDelivery::new().transfer(&t, &control).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn unsupported_scheme_is_permanent() {
        let t = task("gsiftp://se/data/a", "file:/tmp/never/a");
        let err = LocalDelivery::new().resolve(&t).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Other);
        assert!(!err.kind.is_transient());
    }
}
