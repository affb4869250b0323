mod actions;
mod api;
mod client;
mod config;
mod error;
mod filter;
mod listen;
mod logging;
mod lookup;
mod normalize;
mod output;
mod paginate;
mod pipeline;
mod profile;
mod protocol;
mod realtime;
mod state;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::actions::{ActionRunner, SendRequest};
use crate::api::GatewayApi;
use crate::client::{ChatRef, MessengerClient};
use crate::config::Config;
use crate::error::{CliError, ClientError, ConfigError, RetrievalError};
use crate::filter::{FilterOptions, FilterSpec};
use crate::listen::{cancel_on_signal, Dispatcher, SubscriptionScope};
use crate::normalize::Normalizer;
use crate::output::Emitter;
use crate::lookup::lookup_entities;
use crate::paginate::{HistoryDirection, HistoryRange, Paginator, DEFAULT_LIMIT};
use crate::pipeline::{Pipeline, Verdict};
use crate::profile::{Profile, ProfileSet, DEFAULT_PROFILE};
use crate::protocol::{RawObject, SchemaRegistry};
use crate::realtime::GatewayClient;
use crate::state::CursorStore;

#[derive(Parser)]
#[command(
    name = "tgpipe",
    version,
    about = "Fetch, stream and filter messaging account history as JSON lines",
    after_help = "Examples:\n  tgpipe history --chat @team --limit 50 --has-media\n  tgpipe history --chat -100123 --resume --limit 0\n  tgpipe history --chat @team --from-id 100 --to-id 200 --inclusive\n  tgpipe listen --private --pattern \"deploy\"\n  tgpipe listen --chat @alerts --profile slim\n  tgpipe send --chat me --text \"hello\" --file ./report.pdf\n  tgpipe react --chat @team --message-id 42 --emoji 👍\n  tgpipe download --chat @team --message-id 42 --dir ./downloads\n  tgpipe entities @team me 777000\n  cat dump.jsonl | tgpipe filter --from-user 42"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, help = "Log debug output to stderr")]
    debug: bool,

    #[arg(long, global = true, default_value = DEFAULT_PROFILE, help = "Redaction profile from the profiles file")]
    profile: String,

    #[arg(long, global = true, help = "Indent JSON records")]
    pretty: bool,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Fetch message history, newest first")]
    History(HistoryArgs),
    #[command(about = "Stream new and edited messages until interrupted")]
    Listen(ListenArgs),
    #[command(about = "List recent dialogs")]
    Chats(ChatsArgs),
    #[command(about = "Look up users, chats and channels")]
    Entities(EntitiesArgs),
    #[command(about = "Search messages across all chats")]
    Search(SearchArgs),
    #[command(about = "Send a text message or files")]
    Send(SendArgs),
    #[command(about = "Edit a message")]
    Edit(EditArgs),
    #[command(about = "Forward a message to another chat")]
    Forward(ForwardArgs),
    #[command(about = "Press an inline button on a message")]
    Click(ClickArgs),
    #[command(about = "Add a reaction to a message")]
    React(ReactArgs),
    #[command(about = "Download a message attachment")]
    Download(DownloadArgs),
    #[command(about = "Filter and redact JSON records read from stdin")]
    Filter(FilterCommandArgs),
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    #[arg(long, help = "Only messages received by this account")]
    incoming_only: bool,

    #[arg(long, help = "Only messages sent by this account")]
    outgoing_only: bool,

    #[arg(long, value_name = "USER_ID", help = "Only messages from this sender id")]
    from_user: Option<i64>,

    #[arg(long, value_name = "REGEX", help = "Only messages whose text matches (case-insensitive)")]
    pattern: Option<String>,

    #[arg(long, help = "Only messages with media")]
    has_media: bool,

    #[arg(long, help = "Only forwarded messages")]
    forwarded_only: bool,

    #[arg(long, help = "Only replies")]
    replies_only: bool,

    #[arg(long, help = "Only messages with reactions")]
    has_reactions: bool,
}

impl FilterArgs {
    fn spec(&self) -> Result<FilterSpec, ConfigError> {
        FilterSpec::from_options(&FilterOptions {
            incoming_only: self.incoming_only,
            outgoing_only: self.outgoing_only,
            from_user: self.from_user,
            pattern: self.pattern.clone(),
            has_media: self.has_media,
            forwarded_only: self.forwarded_only,
            replies_only: self.replies_only,
            has_reactions: self.has_reactions,
        })
    }
}

#[derive(Args)]
struct HistoryArgs {
    #[arg(long, allow_negative_numbers = true, help = "Chat id, @username, t.me link or \"me\"")]
    chat: String,

    #[arg(
        long,
        visible_alias = "before-id",
        help = "Start past this id (older when reading backward, newer when reading forward)"
    )]
    from_id: Option<i64>,

    #[arg(long, help = "Stop before reaching this id")]
    to_id: Option<i64>,

    #[arg(long, help = "Include the --from-id and --to-id messages themselves")]
    inclusive: bool,

    #[arg(long, conflicts_with = "backward", help = "Read from oldest to newest")]
    forward: bool,

    #[arg(long, help = "Read from newest to oldest (default)")]
    backward: bool,

    #[arg(long, default_value_t = DEFAULT_LIMIT, help = "Messages to read; 0 reads the whole range")]
    limit: usize,

    #[arg(long, conflicts_with = "forward", help = "Continue from the last saved position for this chat")]
    resume: bool,

    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ListenTarget {
    #[arg(long, allow_negative_numbers = true, help = "Listen to one chat")]
    chat: Option<String>,

    #[arg(long, help = "Listen to incoming private messages")]
    private: bool,

    #[arg(long, help = "Listen to every chat")]
    all: bool,
}

#[derive(Args)]
struct ListenArgs {
    #[command(flatten)]
    target: ListenTarget,

    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Args)]
struct ChatsArgs {
    #[arg(long, default_value_t = DEFAULT_LIMIT, help = "Maximum number of dialogs")]
    limit: usize,
}

#[derive(Args)]
struct EntitiesArgs {
    #[arg(required = true, value_name = "CHAT", allow_negative_numbers = true, help = "Id, @username, t.me link or \"me\"")]
    inputs: Vec<String>,
}

#[derive(Args)]
struct SearchArgs {
    #[arg(long, help = "Text to search for")]
    query: String,

    #[arg(long, default_value_t = DEFAULT_LIMIT, help = "Maximum number of results")]
    limit: usize,

    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Args)]
struct SendArgs {
    #[arg(long, allow_negative_numbers = true, help = "Chat id, @username, t.me link or \"me\"")]
    chat: String,

    #[arg(long, help = "Message text (caption when files are attached)")]
    text: Option<String>,

    #[arg(long, help = "Read message text from stdin")]
    stdin: bool,

    #[arg(
        long = "file",
        value_name = "PATH",
        num_args = 1..,
        action = ArgAction::Append,
        help = "File to attach. Repeatable."
    )]
    files: Vec<PathBuf>,

    #[arg(long, help = "Message id to reply to")]
    reply_to: Option<i64>,

    #[arg(
        long,
        allow_negative_numbers = true,
        requires = "reply_to",
        conflicts_with = "files",
        help = "Send the reply here instead; --reply-to then names a message in --chat"
    )]
    target_chat: Option<String>,
}

#[derive(Args)]
struct EditArgs {
    #[arg(long, allow_negative_numbers = true)]
    chat: String,

    #[arg(long)]
    message_id: i64,

    #[arg(long, help = "New message text")]
    text: String,
}

#[derive(Args)]
struct ForwardArgs {
    #[arg(long, allow_negative_numbers = true, help = "Chat the message is in")]
    chat: String,

    #[arg(long)]
    message_id: i64,

    #[arg(long, allow_negative_numbers = true, help = "Chat to forward to")]
    target_chat: String,
}

#[derive(Args)]
struct ClickArgs {
    #[arg(long, allow_negative_numbers = true)]
    chat: String,

    #[arg(long)]
    message_id: i64,

    #[arg(long, help = "Button text")]
    label: String,
}

#[derive(Args)]
struct ReactArgs {
    #[arg(long, allow_negative_numbers = true)]
    chat: String,

    #[arg(long)]
    message_id: i64,

    #[arg(long)]
    emoji: String,
}

#[derive(Args)]
struct DownloadArgs {
    #[arg(long, allow_negative_numbers = true)]
    chat: String,

    #[arg(long, help = "Message id containing the attachment")]
    message_id: i64,

    #[arg(long, conflicts_with = "dir", help = "Output file path")]
    output: Option<PathBuf>,

    #[arg(long, help = "Output directory (defaults to current directory)")]
    dir: Option<PathBuf>,
}

#[derive(Args)]
struct FilterCommandArgs {
    #[command(flatten)]
    filter: FilterArgs,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    logging::init(cli.debug);

    let config = Config::load()?;
    tracing::debug!(
        config = %config.config_path.display(),
        data_dir = %config.data_dir.display(),
        "configuration loaded"
    );
    let profiles = ProfileSet::load(&config.profiles_path)?;
    let profile = profiles.resolve(&cli.profile);
    tracing::debug!(
        profiles = profiles.len(),
        profile = %cli.profile,
        redacting = !profile.is_identity(),
        "profile selected"
    );
    let mut emitter = Emitter::from_adapters(&config.adapters, cli.pretty)?;

    match cli.command {
        Command::Filter(args) => {
            let filter = args.filter.spec()?;
            let pipeline = Pipeline::new(Normalizer::new(Arc::new(SchemaRegistry::builtin())), filter, profile);
            filter_stdin(&pipeline, &mut emitter).await?;
        }
        Command::History(args) => {
            let chat = ChatRef::parse(&args.chat)?;
            let filter = args.filter.spec()?;
            let limit = (args.limit > 0).then_some(args.limit);
            let store = CursorStore::new(config.state_path.clone());

            let mut client = connect(&config).await?;
            let chat_id = resolve_chat(&mut client, &chat).await?;
            let from_id = match (args.from_id, args.resume) {
                (Some(from_id), _) => Some(from_id),
                (None, true) => store.before_id(chat_id)?,
                (None, false) => None,
            };
            let requested = if args.forward {
                Some(HistoryDirection::Forward)
            } else if args.backward {
                Some(HistoryDirection::Backward)
            } else {
                None
            };
            let range = HistoryRange::resolve(from_id, args.to_id, requested, args.inclusive);

            let paginator = Paginator::new(pipeline_for(&client, filter, profile), config.batch_ceiling);
            let summary = paginator.run(&mut client, chat_id, range, limit, &mut emitter).await?;
            if let Some(next) = summary.next_from_id {
                match range.direction {
                    HistoryDirection::Backward => {
                        eprintln!("next-before-id: {next}");
                        if args.resume {
                            store.advance(chat_id, next)?;
                        }
                    }
                    HistoryDirection::Forward => eprintln!("next-after-id: {next}"),
                }
            }
        }
        Command::Listen(args) => {
            let filter = args.filter.spec()?;
            let chat = args.target.chat.as_deref().map(ChatRef::parse).transpose()?;

            let mut client = connect(&config).await?;
            let scope = match chat {
                Some(chat) => SubscriptionScope::Chat(resolve_chat(&mut client, &chat).await?),
                None if args.target.private => SubscriptionScope::AllPrivate,
                None => SubscriptionScope::All,
            };

            let cancel = CancellationToken::new();
            cancel_on_signal(cancel.clone());
            let mut dispatcher = Dispatcher::new(scope, pipeline_for(&client, filter, profile));
            let outcome = dispatcher.run(&mut client, &mut emitter, cancel).await;
            tracing::debug!(state = ?dispatcher.state(), "listener finished");
            outcome?;
        }
        Command::Chats(args) => {
            if args.limit == 0 {
                return Err(ConfigError::InvalidLimit.into());
            }
            let mut client = connect(&config).await?;
            let pipeline = pipeline_for(&client, FilterSpec::default(), profile);
            let dialogs = client.list_chats(args.limit).await.map_err(RetrievalError::History)?;
            for dialog in &dialogs {
                emitter.emit(&pipeline.process_unfiltered(dialog)).await?;
            }
        }
        Command::Entities(args) => {
            let mut client = connect(&config).await?;
            let pipeline = pipeline_for(&client, FilterSpec::default(), profile);
            let failed = lookup_entities(&mut client, &pipeline, &args.inputs, &mut emitter).await?;
            if failed > 0 {
                tracing::warn!(failed, total = args.inputs.len(), "some entity lookups failed");
            }
        }
        Command::Search(args) => {
            if args.limit == 0 {
                return Err(ConfigError::InvalidLimit.into());
            }
            let filter = args.filter.spec()?;
            let mut client = connect(&config).await?;
            let pipeline = pipeline_for(&client, filter, profile);
            let messages = client
                .search(&args.query, args.limit)
                .await
                .map_err(RetrievalError::History)?;
            emit_all(&pipeline, &messages, &mut emitter).await?;
        }
        Command::Send(args) => {
            let chat = ChatRef::parse(&args.chat)?;
            let text = if args.stdin { Some(read_stdin_text()?) } else { args.text };
            let request = SendRequest {
                text,
                files: args.files,
                reply_to: args.reply_to,
            }
            .validated()?;
            let target = args.target_chat.as_deref().map(ChatRef::parse).transpose()?;
            let mut client = connect(&config).await?;
            let chat_id = resolve_chat(&mut client, &chat).await?;
            let runner = ActionRunner::new(pipeline_for(&client, FilterSpec::default(), Profile::default()));
            let result = match (target, request.reply_to) {
                (Some(target), Some(reply_to)) => {
                    let target_id = resolve_chat(&mut client, &target).await?;
                    let text = request.text.unwrap_or_default();
                    runner
                        .reply_across(&mut client, target_id, &text, chat_id, reply_to)
                        .await?
                }
                _ => runner.send(&mut client, chat_id, request).await?,
            };
            emitter.emit(&result).await?;
        }
        Command::Edit(args) => {
            let chat = ChatRef::parse(&args.chat)?;
            let mut client = connect(&config).await?;
            let chat_id = resolve_chat(&mut client, &chat).await?;
            let runner = ActionRunner::new(pipeline_for(&client, FilterSpec::default(), Profile::default()));
            let result = runner.edit(&mut client, chat_id, args.message_id, &args.text).await?;
            emitter.emit(&result).await?;
        }
        Command::Forward(args) => {
            let chat = ChatRef::parse(&args.chat)?;
            let target = ChatRef::parse(&args.target_chat)?;
            let mut client = connect(&config).await?;
            let chat_id = resolve_chat(&mut client, &chat).await?;
            let target_id = resolve_chat(&mut client, &target).await?;
            let runner = ActionRunner::new(pipeline_for(&client, FilterSpec::default(), Profile::default()));
            let result = runner.forward(&mut client, chat_id, args.message_id, target_id).await?;
            emitter.emit(&result).await?;
        }
        Command::Click(args) => {
            let chat = ChatRef::parse(&args.chat)?;
            let mut client = connect(&config).await?;
            let chat_id = resolve_chat(&mut client, &chat).await?;
            let runner = ActionRunner::new(pipeline_for(&client, FilterSpec::default(), Profile::default()));
            let result = runner.click(&mut client, chat_id, args.message_id, &args.label).await?;
            emitter.emit(&result).await?;
        }
        Command::React(args) => {
            let chat = ChatRef::parse(&args.chat)?;
            let mut client = connect(&config).await?;
            let chat_id = resolve_chat(&mut client, &chat).await?;
            let runner = ActionRunner::new(pipeline_for(&client, FilterSpec::default(), Profile::default()));
            let result = runner.react(&mut client, chat_id, args.message_id, &args.emoji).await?;
            emitter.emit(&result).await?;
        }
        Command::Download(args) => {
            let chat = ChatRef::parse(&args.chat)?;
            let mut client = connect(&config).await?;
            let chat_id = resolve_chat(&mut client, &chat).await?;
            let runner = ActionRunner::new(pipeline_for(&client, FilterSpec::default(), Profile::default()));
            let result = runner
                .download(&mut client, chat_id, args.message_id, args.output, args.dir)
                .await?;
            emitter.emit(&result).await?;
        }
    }

    tracing::debug!(emitted = emitter.emitted(), "done");
    Ok(())
}

async fn connect(config: &Config) -> Result<GatewayClient, CliError> {
    let token = config.require_token()?;
    tracing::debug!(url = %config.gateway_url, "connecting to gateway");
    let api = GatewayApi::new(config.api_base_url.clone());
    let client = GatewayClient::connect(&config.gateway_url, api, token)
        .await
        .map_err(ClientError::from)?;
    Ok(client)
}

fn pipeline_for(client: &GatewayClient, filter: FilterSpec, profile: Profile) -> Pipeline {
    Pipeline::new(Normalizer::new(Arc::new(client.schemas())), filter, profile)
}

async fn resolve_chat<C: MessengerClient + ?Sized>(client: &mut C, chat: &ChatRef) -> Result<i64, CliError> {
    let chat_id = client.resolve_chat(chat).await.map_err(|error| match error {
        ClientError::UnknownChat(name) => CliError::Config(ConfigError::UnknownChat(name)),
        other => CliError::Client(other),
    })?;
    tracing::debug!(%chat, chat_id, "resolved chat");
    Ok(chat_id)
}

async fn emit_all(pipeline: &Pipeline, records: &[RawObject], emitter: &mut Emitter) -> Result<(), CliError> {
    for record in records {
        if let Verdict::Emit(value) = pipeline.process(record) {
            emitter.emit(&value).await?;
        }
    }
    Ok(())
}

/// Runs every stdin line through the pipeline. Lines that are not JSON (or
/// not UTF-8) are kept as plain strings.
async fn filter_stdin(pipeline: &Pipeline, emitter: &mut Emitter) -> Result<(), CliError> {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut buf = Vec::new();
    let mut rejected = 0usize;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match pipeline.process(&RawObject::from_wire_line(line)) {
            Verdict::Emit(value) => emitter.emit(&value).await?,
            Verdict::Rejected => rejected += 1,
        }
    }
    tracing::debug!(emitted = emitter.emitted(), rejected, "stdin drained");
    Ok(())
}

fn read_stdin_text() -> Result<String, CliError> {
    let mut text = String::new();
    std::io::stdin().read_to_string(&mut text)?;
    Ok(text.trim_end().to_string())
}
