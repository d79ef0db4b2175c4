use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use sifen_autofix::config::{Config, Environment};
use sifen_autofix::error::ExitStatus;
use sifen_autofix::orchestrator::commands;
use sifen_autofix::utils::logging;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "sifen", version, about = "SIFEN 电子发票客户端与 0160 自动修复")]
struct Cli {
    /// 配置文件（TOML）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 显示详细日志
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 提交一个批次
    Send {
        #[command(flatten)]
        target: TargetArgs,
        /// rDE 或 rLoteDE 文件
        #[arg(long)]
        xml: PathBuf,
    },
    /// 查询批次状态
    Follow {
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,
        /// 只查询一次，使用指定的提交响应
        #[arg(long)]
        once: Option<PathBuf>,
    },
    /// 提交并自动修复 0160
    Autofix {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        xml: PathBuf,
        /// 最多提交几轮
        #[arg(long)]
        max_iter: Option<u32>,
        /// 查询间隔（秒）
        #[arg(long)]
        poll_every: Option<u64>,
        /// 每轮最多查询几次
        #[arg(long)]
        max_poll: Option<u32>,
    },
    /// 根据发票描述构建 DE
    Build {
        #[arg(long)]
        invoice: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// 构建后签名
        #[arg(long)]
        sign: bool,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// test 或 prod
    #[arg(long)]
    env: Option<Environment>,
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,
}

impl TargetArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(env) = self.env {
            config.environment = env;
        }
        if let Some(dir) = &self.artifacts_dir {
            config.artifacts_dir = dir.clone();
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // 加载配置：文件 → 环境变量 → 命令行
    let config = match Config::load(cli.config.as_deref())
        .and_then(|c| c.apply_env_overrides(|key| std::env::var(key).ok()))
    {
        Ok(config) => config,
        Err(e) => {
            logging::init(cli.verbose);
            error!("❌ {}", e);
            return ExitCode::from(e.exit_status().code());
        }
    };

    // 初始化日志
    logging::init(cli.verbose || config.verbose_logging);

    let status = match run(cli.command, config).await {
        Ok(status) => status,
        Err(e) => {
            error!("❌ {:#}", e);
            commands::exit_status_of(&e)
        }
    };
    ExitCode::from(status.code())
}

async fn run(command: Command, mut config: Config) -> Result<ExitStatus> {
    match command {
        Command::Send { target, xml } => {
            target.apply(&mut config);
            commands::send(&config, &xml).await
        }
        Command::Follow {
            artifacts_dir,
            once,
        } => {
            if let Some(dir) = artifacts_dir {
                config.artifacts_dir = dir;
            }
            commands::follow(&config, once.as_deref()).await
        }
        Command::Autofix {
            target,
            xml,
            max_iter,
            poll_every,
            max_poll,
        } => {
            target.apply(&mut config);
            if let Some(n) = max_iter {
                config.autofix.max_iter = n;
            }
            if let Some(secs) = poll_every {
                config.autofix.poll_every_secs = secs;
            }
            if let Some(n) = max_poll {
                config.autofix.max_poll = n;
            }
            commands::autofix(&config, xml).await
        }
        Command::Build { invoice, out, sign } => commands::build(&config, &invoice, &out, sign).await,
    }
}
