//! # Model Gateway 主程序

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rand::Rng;
use rand::distributions::Alphanumeric;

use model_gateway::config::{self, CONFIG_PATH_ENV, ConfigCrypto};
use model_gateway::logging::{self, LogComponent, LogStage};
use model_gateway::proxy::{GatewayBuilder, GatewayServer};
use model_gateway::{GatewayError, Result, lerror, linfo};

/// 调用方 key 中随机部分的长度
const KEY_PREFIX_LEN: usize = 8;
const KEY_SECRET_LEN: usize = 32;

#[derive(Parser, Debug)]
#[command(version, about = "OpenAI-compatible multi-tenant model gateway", long_about = None)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, env = CONFIG_PATH_ENV, default_value = "config/gateway.toml")]
    config: PathBuf,

    /// 覆盖配置中的日志级别
    #[arg(long)]
    log_level: Option<String>,

    /// 输出 JSON 行日志
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动数据面服务（默认）
    Serve,
    /// 生成新的凭证加密密钥（64 位十六进制）
    GenKey,
    /// 输出 token 的 bcrypt 哈希，填入 key 记录的 key_hash
    HashKey {
        token: String,
        #[arg(long, default_value_t = bcrypt::DEFAULT_COST)]
        cost: u32,
    },
    /// 用密钥环境变量中的密钥加密上游凭证，输出 `enc:` 引用
    Encrypt {
        plaintext: String,
        #[arg(long, default_value = "GATEWAY_SECRET_KEY")]
        key_env: String,
    },
    /// 生成调用方 API key 及其 bcrypt 哈希
    NewApiKey {
        #[arg(long, default_value_t = bcrypt::DEFAULT_COST)]
        cost: u32,
    },
}

fn random_alnum(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn hash_token(token: &str, cost: u32) -> Result<String> {
    bcrypt::hash(token, cost).map_err(|e| GatewayError::internal_with_source("bcrypt 哈希失败", e))
}

fn new_api_key(cost: u32) -> Result<()> {
    let prefix = random_alnum(KEY_PREFIX_LEN).to_ascii_lowercase();
    let token = format!("sk-{prefix}-{}", random_alnum(KEY_SECRET_LEN));
    let hash = hash_token(&token, cost)?;
    println!("token    = {token}");
    println!("prefix   = {prefix}");
    println!("key_hash = {hash}");
    Ok(())
}

async fn serve(cli: &Cli) -> Result<()> {
    let config = Arc::new(config::load_config(&cli.config)?);
    logging::init_logging(
        Some(cli.log_level.as_deref().unwrap_or(&config.logging.level)),
        cli.json_logs || config.logging.json,
    );
    linfo!(
        "system",
        LogStage::Configuration,
        LogComponent::Config,
        "config_loaded",
        "配置加载完成",
        path = cli.config.display().to_string()
    );

    let gateway = GatewayBuilder::new(Arc::clone(&config)).build().await?;
    GatewayServer::new(config.server.clone(), gateway).serve().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        None | Some(Command::Serve) => {
            if let Err(e) = serve(&cli).await {
                lerror!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Main,
                    "service_start_failed",
                    "服务启动失败",
                    error = e.to_string()
                );
                return Err(e);
            }
            Ok(())
        }
        Some(Command::GenKey) => {
            println!("{}", ConfigCrypto::generate_key());
            Ok(())
        }
        Some(Command::Encrypt { plaintext, key_env }) => {
            println!("{}", ConfigCrypto::from_env(key_env)?.encrypt(plaintext)?);
            Ok(())
        }
        Some(Command::HashKey { token, cost }) => {
            println!("{}", hash_token(token, *cost)?);
            Ok(())
        }
        Some(Command::NewApiKey { cost }) => new_api_key(*cost),
    }
}
