//! 内容安全扫描接口与内置实现。
//!
//! 引擎只关心 accept/reject；扫描出错时由调用方按拒绝处理。

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("scanner failed to run: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("scanner timed out after {0:?}")]
    Timeout(Duration),
    #[error("scanner exited with unexpected status {0}")]
    Status(String),
    #[error("scanner is not configured correctly: {0}")]
    Config(String),
}

#[async_trait]
pub trait ContentScanner: Send + Sync {
    fn name(&self) -> &str;

    async fn scan(&self, path: &Path) -> Result<Verdict, ScanError>;
}

/// 不做任何检查。
#[derive(Debug, Default)]
pub struct AcceptAll;

#[async_trait]
impl ContentScanner for AcceptAll {
    fn name(&self) -> &str {
        "accept-all"
    }

    async fn scan(&self, _path: &Path) -> Result<Verdict, ScanError> {
        Ok(Verdict::Accept)
    }
}

/// 调用外部程序扫描文件，文件路径作为最后一个参数。
///
/// 退出码 0 表示通过，1 表示拒绝（与 clamscan 约定一致），其余视为错误。
#[derive(Debug)]
pub struct CommandScanner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandScanner {
    /// 按空白切分命令行，例如 `clamdscan --no-summary`。
    pub fn from_command_line(command: &str, timeout: Duration) -> Result<Self, ScanError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ScanError::Config("empty scan command".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }
}

#[async_trait]
impl ContentScanner for CommandScanner {
    fn name(&self) -> &str {
        &self.program
    }

    async fn scan(&self, path: &Path) -> Result<Verdict, ScanError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let output = time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ScanError::Timeout(self.timeout))??;
        debug!(program = self.program, status = %output.status, "scanner finished");

        match output.status.code() {
            Some(0) => Ok(Verdict::Accept),
            Some(1) => {
                let report = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let reason = if report.is_empty() {
                    "flagged by content scanner".to_string()
                } else {
                    report
                };
                Ok(Verdict::Reject(reason))
            }
            _ => Err(ScanError::Status(output.status.to_string())),
        }
    }
}
