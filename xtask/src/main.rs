use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use xshell::{Shell, cmd};

/// 安装到 /usr/local/bin 的可执行文件
const BINARIES: [&str; 3] = ["buzzlink-daemon", "buzzlink", "buzzlink-tui"];
const UNIT: &str = "buzzlink.service";

#[derive(Parser)]
#[command(name = "xtask", about = "Buzzlink 开发任务")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建守护进程、CLI 和 TUI (release)
    Build,
    /// 前台运行守护进程
    Dev {
        #[arg(short, long, value_enum, default_value_t = Level::Debug)]
        log_level: Level,
    },
    /// 运行 TUI，日志写入文件
    Tui {
        #[arg(short, long, value_enum, default_value_t = Level::Info)]
        log_level: Level,
        /// 日志文件 (默认 /tmp/buzzlink.log)
        #[arg(short = 'o', long)]
        log_file: Option<PathBuf>,
    },
    /// 通过运行中的守护进程发送一次振动
    Buzz,
    /// 格式、lint 和不依赖蓝牙硬件的测试
    Check,
    /// 安装二进制并启用 systemd 用户服务
    Install,
    /// 停用服务并删除已安装文件
    Uninstall,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

/// 本项目 crate 用指定级别，蓝牙栈最多到 info
fn log_filter(level: Level) -> String {
    let stack = match level {
        Level::Trace | Level::Debug => "info",
        other => other.as_str(),
    };
    format!(
        "warn,buzzlink_core={l},buzzlink_daemon={l},buzzlink_tui={l},bluer={s},btleplug={s}",
        l = level.as_str(),
        s = stack
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    let project_root = match std::env::var("CARGO_MANIFEST_DIR")
        .map(PathBuf::from)
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    sh.change_dir(&project_root);

    match cli.command {
        Commands::Build => build(&sh),
        Commands::Dev { log_level } => dev(&sh, log_level),
        Commands::Tui {
            log_level,
            log_file,
        } => tui(&sh, log_level, log_file),
        Commands::Buzz => buzz(&sh),
        Commands::Check => check(&sh),
        Commands::Install => install(&sh),
        Commands::Uninstall => uninstall(&sh),
    }
}

fn build(sh: &Shell) -> Result<()> {
    println!("🔨 构建...");
    cmd!(
        sh,
        "cargo build --release -p buzzlink-daemon -p buzzlink-cli -p buzzlink-tui"
    )
    .run()?;
    Ok(())
}

fn dev(sh: &Shell, level: Level) -> Result<()> {
    let filter = log_filter(level);
    println!("🚀 守护进程 (RUST_LOG={filter})");
    // 与已安装的服务争用 socket
    let _ = cmd!(sh, "systemctl --user stop {UNIT}").quiet().ignore_stderr().run();
    let _env = sh.push_env("RUST_LOG", filter);
    cmd!(sh, "cargo run -p buzzlink-daemon").run()?;
    Ok(())
}

fn tui(sh: &Shell, level: Level, log_file: Option<PathBuf>) -> Result<()> {
    let log_file = log_file.unwrap_or_else(|| PathBuf::from("/tmp/buzzlink.log"));
    println!("🖥️  TUI 日志: {}  (tail -f 查看)", log_file.display());

    // TUI 占用终端，stderr 重定向到文件
    let command = format!(
        "RUST_LOG='{}' cargo run -p buzzlink-tui 2>> '{}'",
        log_filter(level),
        log_file.display()
    );
    cmd!(sh, "bash -c {command}").run()?;
    Ok(())
}

fn buzz(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo run -q -p buzzlink-cli -- vibrate").run()?;
    cmd!(sh, "cargo run -q -p buzzlink-cli -- status").run()?;
    Ok(())
}

fn check(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
    // 控制器测试跑在记录型适配器上
    cmd!(sh, "cargo test --workspace").run()?;
    println!("✅ 检查通过");
    Ok(())
}

fn install(sh: &Shell) -> Result<()> {
    build(sh)?;

    let _ = cmd!(sh, "systemctl --user stop {UNIT}").run();
    std::thread::sleep(std::time::Duration::from_millis(500));

    for bin in BINARIES {
        cmd!(sh, "sudo install -m 755 target/release/{bin} /usr/local/bin/{bin}").run()?;
    }

    // 通知监听依赖会话总线，以用户服务运行
    let unit_dir = user_unit_dir(
        std::env::var("XDG_CONFIG_HOME").ok(),
        std::env::var("HOME").ok(),
    )?;
    sh.create_dir(&unit_dir)?;
    sh.copy_file(format!("assets/{UNIT}"), &unit_dir)?;

    cmd!(sh, "systemctl --user daemon-reload").run()?;
    cmd!(sh, "systemctl --user enable --now {UNIT}").run()?;

    println!("✅ 已安装，systemctl --user status buzzlink 查看状态");
    println!("   服务已转发通知，不要再运行 buzzlink listen");
    Ok(())
}

fn uninstall(sh: &Shell) -> Result<()> {
    let _ = cmd!(sh, "systemctl --user disable --now {UNIT}").run();

    let unit_dir = user_unit_dir(
        std::env::var("XDG_CONFIG_HOME").ok(),
        std::env::var("HOME").ok(),
    )?;
    sh.remove_path(unit_dir.join(UNIT))?;
    for bin in BINARIES {
        let _ = cmd!(sh, "sudo rm -f /usr/local/bin/{bin}").run();
    }

    cmd!(sh, "systemctl --user daemon-reload").run()?;
    println!("✅ 已卸载");
    Ok(())
}

/// systemd 用户单元目录
fn user_unit_dir(config_home: Option<String>, home: Option<String>) -> Result<PathBuf> {
    let base = match (config_home.filter(|d| !d.is_empty()), home) {
        (Some(dir), _) => PathBuf::from(dir),
        (None, Some(home)) => PathBuf::from(home).join(".config"),
        (None, None) => anyhow::bail!("HOME 和 XDG_CONFIG_HOME 均未设置"),
    };
    Ok(base.join("systemd/user"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_caps_bluetooth_stack() {
        assert_eq!(
            log_filter(Level::Trace),
            "warn,buzzlink_core=trace,buzzlink_daemon=trace,buzzlink_tui=trace,bluer=info,btleplug=info"
        );
        assert!(log_filter(Level::Error).ends_with("bluer=error,btleplug=error"));
    }

    #[test]
    fn test_user_unit_dir() {
        assert_eq!(
            user_unit_dir(Some("/xdg".into()), Some("/home/u".into())).unwrap(),
            PathBuf::from("/xdg/systemd/user")
        );
        assert_eq!(
            user_unit_dir(Some(String::new()), Some("/home/u".into())).unwrap(),
            PathBuf::from("/home/u/.config/systemd/user")
        );
        assert!(user_unit_dir(None, None).is_err());
    }
}
