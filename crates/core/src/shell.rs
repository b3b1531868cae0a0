//! 发往远程Worker的命令所用的 shell 转义工具

use std::borrow::Cow;

use shell_escape::unix::escape;

/// 转义后 `sh` 将其视为单个字面量参数
pub fn quote(value: &str) -> String {
    escape(Cow::Borrowed(value)).into_owned()
}

/// 会话用户不是 root 时加上 `sudo` 前缀
pub fn privileged(command: &str, is_root: bool) -> String {
    if is_root {
        command.to_string()
    } else {
        format!("sudo {command}")
    }
}
