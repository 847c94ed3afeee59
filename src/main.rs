use std::fs;
use std::io::{self, Read, Write};
use std::process;

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pagelingo::env::core::LogLevel;
use pagelingo::env::{is_language_code, EnvVar};
use pagelingo::parsers::html::{
    get_charset, get_title, html_to_dom, serialize_document, set_document_lang,
};
use pagelingo::translation::{
    ClientProcessor, ConfigManager, EventSink, HttpTranslationClient, PageTranslator,
    RunStatus, TranslationCache, TranslationConfig, TranslationError, TranslationResult,
};

const ANSI_COLOR_RED: &str = "\x1b[31m";
const ANSI_COLOR_RESET: &str = "\x1b[0m";

#[derive(Parser, Debug)]
#[command(
    name = "pagelingo",
    version,
    about = "Translate the text of an HTML page in place, keeping its markup intact"
)]
struct Cli {
    /// HTML file to translate, "-" reads stdin
    #[arg(required_unless_present_any = ["init_config", "env_help"])]
    input: Option<String>,

    /// Target language code
    #[arg(short = 't', long = "target-lang")]
    target_lang: Option<String>,

    /// Translation API endpoint
    #[arg(long = "api-url")]
    api_url: Option<String>,

    /// Config file (TOML or JSON); defaults to the standard search paths
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Persistent cache database
    #[arg(long = "cache", conflicts_with = "no_cache")]
    cache: Option<String>,

    /// Disable the translation cache
    #[arg(long = "no-cache")]
    no_cache: bool,

    /// Output file; supports %title%, %lang% and %timestamp%. Defaults to stdout
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// Input charset, overrides the document's own declaration
    #[arg(short = 'E', long = "encoding")]
    encoding: Option<String>,

    /// Exit with an error when any batch fails
    #[arg(long = "strict")]
    strict: bool,

    /// Write a config file with every default and exit
    #[arg(long = "init-config", value_name = "PATH")]
    init_config: Option<String>,

    /// List the PAGELINGO_* environment variables and exit
    #[arg(long = "env-help")]
    env_help: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_logging();

    let cli = Cli::parse();
    if cli.env_help {
        print!("{}", pagelingo::env::generate_env_docs());
        return;
    }
    if let Some(path) = &cli.init_config {
        match ConfigManager::generate_example_config(path) {
            Ok(()) => print_info_message(&format!("已生成配置文件 {}", path)),
            Err(e) => {
                print_error_message(&e.to_string());
                process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = run(cli).await {
        print_error_message(&format!("翻译失败: {}", e));
        process::exit(1);
    }
}

fn init_logging() {
    let level = LogLevel::get().unwrap_or_else(|e| {
        print_error_message(&e.to_string());
        "info".to_string()
    });
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(io::stderr)
        .with_target(true)
        .init();
}

fn load_config(cli: &Cli) -> TranslationResult<TranslationConfig> {
    let manager = match &cli.config {
        Some(path) => ConfigManager::from_path(path)?,
        None => ConfigManager::new()?,
    };
    let target_lang = match &cli.target_lang {
        Some(lang) if !is_language_code(lang) => {
            return Err(TranslationError::InvalidInput(format!(
                "无效的语言代码: {}",
                lang
            )));
        }
        Some(lang) => lang.clone(),
        None => manager.get_config().target_lang.clone(),
    };
    let mut config = manager.create_simple_config(&target_lang, cli.api_url.as_deref());

    if let Some(path) = &cli.cache {
        config.cache_enabled = true;
        config.cache_path = Some(path.clone());
    }
    if cli.no_cache {
        config.cache_enabled = false;
    }
    // 命令行总是一次性翻译整页
    config.translate_full_page = true;

    config.validate()?;
    Ok(config)
}

fn read_input(input: &str) -> TranslationResult<Vec<u8>> {
    if input == "-" {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        fs::read(input).map_err(|e| {
            TranslationError::InvalidInput(format!("无法读取输入文件 {}: {}", input, e))
        })
    }
}

async fn run(cli: Cli) -> TranslationResult<()> {
    let config = load_config(&cli)?;
    let input = cli.input.as_deref().unwrap_or("-");
    let data = read_input(input)?;

    // 先按 UTF-8 解析一次以读取文档声明的字符集
    let encoding = match &cli.encoding {
        Some(label) => label.clone(),
        None => {
            let probe = html_to_dom(&data, "utf-8");
            get_charset(&probe.document).unwrap_or_else(|| "utf-8".to_string())
        }
    };
    let dom = html_to_dom(&data, &encoding);

    let cache = TranslationCache::from_config(&config)?;
    if let Some(cache) = &cache {
        let purged = cache.purge_expired();
        if purged > 0 {
            tracing::info!("清理过期缓存 {} 条", purged);
        }
    }

    let client = HttpTranslationClient::from_config(&config)?;
    let processor = ClientProcessor::new(client, &config.target_lang);
    let (events, mut rx) = EventSink::channel();

    let mut translator =
        PageTranslator::new(dom.document.clone(), &config, cache, processor, events)?;
    let pass = translator.translate_page().await?;

    while let Ok(event) = rx.try_recv() {
        tracing::debug!("事件: {}", event.name());
    }

    if let Some(summary) = &pass.summary {
        print_info_message(&format!(
            "{} 个文本单元，成功 {}，失败 {}，缓存命中 {}，耗时 {} ms",
            summary.total,
            summary.success_count,
            summary.failed_count,
            summary.cache_hits,
            summary.elapsed_ms
        ));
        if cli.strict && (summary.failed_count > 0 || pass.status == Some(RunStatus::Aborted)) {
            return Err(TranslationError::BatchProcessingError(format!(
                "{} 个文本单元翻译失败",
                summary.failed_count
            )));
        }
    }

    if let Some(cache) = translator.engine().cache() {
        tracing::debug!("缓存命中率 {:.1}%", cache.stats().hit_rate() * 100.0);
    }
    tracing::debug!(
        "引擎累计耗时 {} ms",
        translator.engine().stats().processing_time_ms()
    );

    if pass.apply.applied > 0 {
        set_document_lang(&dom.document, &config.target_lang);
    }

    let bytes = serialize_document(&dom, &encoding)?;
    match &cli.output {
        Some(path) => {
            let title = get_title(&dom.document);
            let path = format_output_path(path, title.as_deref(), &config.target_lang);
            fs::write(&path, bytes).map_err(|e| {
                TranslationError::WriteError(format!("无法写入输出文件 {}: {}", path, e))
            })?;
            print_info_message(&format!("已写入 {}", path));
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }

    Ok(())
}

/// 展开输出路径中的 %title%、%lang% 和 %timestamp%
fn format_output_path(path: &str, document_title: Option<&str>, lang: &str) -> String {
    let datetime = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let title = document_title
        .unwrap_or("")
        .replace(['/', '\\'], "_")
        .replace('<', "[")
        .replace('>', "]")
        .replace(':', " - ")
        .replace(['"', '?'], "")
        .replace('|', "-");

    path.replace("%timestamp%", &datetime.replace(':', "_"))
        .replace("%title%", title.trim_start_matches('.'))
        .replace("%lang%", lang)
}

fn print_error_message(msg: &str) {
    eprintln!("{ANSI_COLOR_RED}{msg}{ANSI_COLOR_RESET}");
}

// 正文输出到 stdout，提示信息走 stderr
fn print_info_message(msg: &str) {
    eprintln!("{msg}");
}
