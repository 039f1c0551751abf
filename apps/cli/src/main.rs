use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use reviewer_core_sdk::{config, db, server, telemetry};

/**
 * \brief CLI 程序入口：初始化 AI 配置或启动审核服务。
 */
#[derive(Parser, Debug)]
#[command(name = "reviewer", version, about = "AI content review backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 写入 AI Provider 覆盖配置文件。
     * \param api_key  API Key
     * \param base_url API 基地址
     * \param model    模型名
     * \param provider Provider 类型
     */
    Init {
        #[arg(long, default_value = "openai")]
        provider: String,
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = "")]
        base_url: String,
        #[arg(long, default_value = "gpt-3.5-turbo")]
        model: String,
    },

    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            provider,
            api_key,
            base_url,
            model,
        } => {
            let conn = db::open_default_db().context("open database failed")?;
            db::migrate(&conn).context("apply migrations failed")?;

            let store = config::SettingsStore::default_store();
            let base_url = if base_url.is_empty() {
                config::env_defaults().base_url
            } else {
                base_url
            };
            let settings = config::AiSettings {
                provider: provider.clone(),
                api_key,
                base_url,
                model: model.clone(),
            };
            store.save(&settings).context("save ai config failed")?;
            telemetry::log_event(
                "cli.init",
                &format!("ai config saved provider={} model={}", provider, model),
            );
            println!(
                "Saved AI config to {} (provider={} | model={})",
                store.path().display(),
                provider,
                model
            );
        }
        Commands::Serve { addr } => {
            server::run(&addr).await?;
        }
    }

    Ok(())
}
