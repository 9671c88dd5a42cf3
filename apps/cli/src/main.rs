use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use modeldock_core_sdk::{
    catalog::{self, ModelPatch},
    config::Config,
    crypto::SecretCipher,
    db::{AdminStore, SqliteStore},
    dispatch,
    llm::{self, ChatRequest},
    models::{Message, ModelKey},
    providers::{self, NewProvider},
    server, sync, telemetry,
};

/**
 * \brief CLI 程序入口：Provider 管理、模型同步、目录查询与对话。
 */
#[derive(Parser, Debug)]
#[command(name = "modeldock", version, about = "ModelDock provider/model catalog")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 新增 Provider。
     */
    ProviderAdd {
        #[arg(long)]
        slug: String,
        #[arg(long)]
        display_name: String,
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, default_value_t = false)]
        inactive: bool,
        #[arg(long)]
        notes: Option<String>,
    },

    /**
     * \brief 列出 Provider（不显示 Key）。
     */
    ProviderList,

    /**
     * \brief 从上游同步模型目录。
     */
    Sync {
        /** \brief 仅同步指定 slug，可为未启用的 Provider */
        #[arg(long)]
        provider: Option<String>,
    },

    /**
     * \brief 列出模型：默认为公开视图，`--all` 显示含禁用条目的管理视图。
     */
    Models {
        #[arg(long, default_value_t = false)]
        all: bool,
    },

    /**
     * \brief 启用/禁用或重命名目录中的模型。
     */
    ModelSet {
        /** \brief 组合 ID，如 openai:gpt-4o */
        #[arg(long)]
        id: String,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        sort: Option<i64>,
    },

    /**
     * \brief 发送一条消息并流式显示回复；不指定模型时输出演示流。
     */
    Chat {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        prompt: String,
    },

    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("load config failed")?;
    telemetry::init(config.telemetry_enabled);

    let kv = SqliteStore::open(&config.db_path).context("open database failed")?;
    let store = AdminStore::new(Arc::new(kv), config.environment.clone());
    let cipher = SecretCipher::from_base64_key(config.encryption_key.as_deref())
        .context("load encryption key failed")?;

    match cli.command {
        Commands::ProviderAdd {
            slug,
            display_name,
            base_url,
            api_key,
            inactive,
            notes,
        } => {
            let provider = providers::create(
                &store,
                &cipher,
                NewProvider {
                    slug,
                    display_name,
                    base_url,
                    api_key,
                    is_active: Some(!inactive),
                    notes,
                },
            )
            .context("save provider failed")?;
            println!(
                "Saved provider id={} (slug={} | {} | active={})",
                provider.id, provider.slug, provider.base_url, provider.is_active
            );
        }
        Commands::ProviderList => {
            for p in providers::list(&store).context("load providers failed")? {
                println!(
                    "{}\t{}\t{}\tactive={}\tkey={}",
                    p.id, p.slug, p.base_url, p.is_active, p.has_api_key
                );
            }
        }
        Commands::Sync { provider } => {
            let client = config.http_client()?;
            let report = sync::sync(&store, &cipher, &client, provider.as_deref())
                .await
                .context("sync failed")?;
            for s in &report.synced {
                println!("synced {} ({} models)", s.slug, s.discovered);
            }
            for s in &report.skipped {
                println!("skipped {}: {}", s.slug, s.reason);
            }
            println!("total models: {}", report.total_models);
        }
        Commands::Models { all } => {
            if all {
                for m in catalog::list_models(&store, true).context("load catalog failed")? {
                    println!(
                        "{}\t{}\tenabled={}\tsort={}",
                        m.composite_id(),
                        m.display_label(),
                        m.is_enabled(),
                        m.sort
                    );
                }
            } else {
                let public = catalog::public_catalog(&store).context("load catalog failed")?;
                for m in &public.models {
                    let marker = if public.defaults.model.as_deref() == Some(m.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!("{} {}\t{}", marker, m.id, m.label);
                }
            }
        }
        Commands::ModelSet {
            id,
            enable,
            disable,
            label,
            sort,
        } => {
            let (provider, value) = dispatch::split_model_id(&id)?;
            let enabled = match (enable, disable) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let model = catalog::update_model(
                &store,
                &ModelKey::new(provider, value),
                ModelPatch {
                    label,
                    enabled,
                    sort,
                    description: None,
                },
            )?;
            println!(
                "{}\t{}\tenabled={}\tsort={}",
                model.composite_id(),
                model.display_label(),
                model.is_enabled(),
                model.sort
            );
        }
        Commands::Chat { model, prompt } => {
            let request = ChatRequest {
                messages: vec![Message {
                    role: "user".to_string(),
                    content: prompt,
                }],
                temperature: None,
                max_tokens: None,
            };
            match model {
                Some(model) => {
                    let target = dispatch::resolve(&store, &cipher, &model)
                        .with_context(|| format!("resolve model {} failed", model))?;
                    let client = config.streaming_client()?;
                    let mut stream = llm::stream_chat_deltas(&client, &target, &request)
                        .await
                        .context("create stream failed")?;
                    while let Some(delta) = stream
                        .as_mut()
                        .next()
                        .await
                        .transpose()
                        .context("stream error")?
                    {
                        print!("{}", delta);
                        std::io::stdout().flush().ok();
                    }
                }
                None => {
                    for part in llm::MOCK_CHUNKS {
                        print!("{}", part);
                    }
                }
            }
            println!();
        }
        Commands::Serve { addr } => {
            drop(store);
            server::run(&addr, config).await?;
        }
    }

    Ok(())
}
