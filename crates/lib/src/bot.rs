//! Telegram front end: admin gate, bot commands, confirmation buttons, and the sink that
//! delivers session output to the chat.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::channels::{
    escape_code, escape_markdown, BotCommand, Inbound, InboundCallback, InboundMessage,
    InlineButton, TelegramChannel,
};
use crate::config::{self, Config};
use crate::engine::{Decision, Engine, EngineSettings, OutputSink};
use crate::session::{ProcessExit, SessionError, SessionStatus};

pub const CONFIRM_YES: &str = "confirm_yes";
pub const CONFIRM_NO: &str = "confirm_no";
const CONFIRM_PREFIX: &str = "confirm_";

const ACCESS_DENIED: &str = "Access denied.";

pub const SUPPORTED_OS: &str = r#"anolis 7|8|23
opencloudos 8|9|23
rocky 8|9|10
oracle 8|9
almalinux 8|9|10
centos 9|10
fedora 41|42
nixos 25.05
debian 9|10|11|12|13
opensuse 15.6|tumbleweed
alpine 3.19|3.20|3.21|3.22
openeuler 20.03|22.03|24.03|25.03
ubuntu 16.04|18.04|20.04|22.04|24.04|25.04 [--minimal]
kali
arch
gentoo
aosc
fnos
redhat --img="http://.../rhel.qcow2"
dd --img="http://.../image.raw[.gz|.xz|.zst]"
windows --image-name="windows 11 pro" --lang=en-us
windows --image-name="windows 11 pro" --iso="http://.../win11.iso"
netboot.xyz"#;

const HELP: &str = "Hi! The OS reinstall bot is ready.\n\
Commands:\n\
/list - supported OS\n\
/reinstall <distro> <version> [options...] - run a reinstall\n\
/progress - follow the running log\n\n\
Examples:\n\
/reinstall ubuntu 24.04 --minimal --password P@ssw0rd!\n\
/reinstall debian 12 --ssh-key ssh-ed25519";

const USAGE: &str = "Usage: /reinstall <distro> <version|option> [option...]";

/// MarkdownV2 confirmation prompt for a rendered command.
pub fn confirmation_prompt(rendered: &str) -> String {
    format!(
        "*Confirm OS reinstall*\nCommand:\n```\n{}\n```\n\n{}\nContinue?",
        escape_code(rendered),
        escape_markdown("⚠️ This will change the OS and may reboot.")
    )
}

/// Human-readable text for a session's terminal status.
pub fn render_status(status: &SessionStatus) -> String {
    match status {
        SessionStatus::Completed {
            exit,
            cap,
            suppressed,
        } => {
            let mut text = String::new();
            if *suppressed > 0 {
                text.push_str(&format!(
                    "Output truncated after {} lines ({} more not shown), full record in the persistent log.\n",
                    cap, suppressed
                ));
            }
            match exit {
                ProcessExit::Code(c) => text.push_str(&format!("Process finished with code: {}.", c)),
                ProcessExit::Signal(s) => text.push_str(&format!("Process terminated by signal {}.", s)),
            }
            text.push_str(" Use /progress to view the log.");
            text
        }
        SessionStatus::TailFinished { timed_out: true, .. } => {
            "Stopped following the log (time limit reached).".to_string()
        }
        SessionStatus::TailFinished { timed_out: false, exit } => match exit {
            Some(e) => format!("Log follower exited with {}.", e),
            None => "Log follower exited.".to_string(),
        },
        SessionStatus::Failed(SessionError::LogNotFound(path)) => {
            format!("No log yet at {}.", path.display())
        }
        SessionStatus::Failed(e) => {
            let mut s = e.to_string();
            if let Some(first) = s.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            s
        }
    }
}

/// Delivers session output to Telegram chats, one message per call.
pub struct TelegramSink {
    telegram: Arc<TelegramChannel>,
}

impl TelegramSink {
    pub fn new(telegram: Arc<TelegramChannel>) -> Self {
        Self { telegram }
    }
}

#[async_trait]
impl OutputSink for TelegramSink {
    async fn emit_line(&self, conversation_id: &str, text: &str) -> Result<(), String> {
        // Telegram rejects empty messages.
        if text.trim().is_empty() {
            return Ok(());
        }
        self.telegram
            .send_message(conversation_id, text)
            .await
            .map_err(|e| e.to_string())
    }

    async fn emit_status(&self, conversation_id: &str, status: &SessionStatus) {
        if let Err(e) = self
            .telegram
            .send_message(conversation_id, &render_status(status))
            .await
        {
            log::warn!("bot: sending status to {} failed: {}", conversation_id, e);
        }
    }
}

/// Dispatches inbound Telegram events for the single admin user.
pub struct Bot {
    telegram: Arc<TelegramChannel>,
    engine: Engine,
    admin_id: i64,
}

impl Bot {
    pub fn new(telegram: Arc<TelegramChannel>, engine: Engine, admin_id: i64) -> Self {
        Self {
            telegram,
            engine,
            admin_id,
        }
    }

    pub async fn handle(&self, inbound: Inbound) {
        match inbound {
            Inbound::Message(m) => self.handle_message(m).await,
            Inbound::Callback(c) => self.handle_callback(c).await,
        }
    }

    async fn reply(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.telegram.send_message(chat_id, text).await {
            log::warn!("bot: reply to {} failed: {}", chat_id, e);
        }
    }

    async fn handle_message(&self, msg: InboundMessage) {
        let Some(cmd) = BotCommand::parse(&msg.text) else {
            return;
        };
        if !matches!(cmd.name.as_str(), "start" | "list" | "reinstall" | "progress") {
            return;
        }
        let chat = msg.conversation_id.as_str();
        if msg.user_id != Some(self.admin_id) {
            log::info!("bot: rejected /{} from user {:?}", cmd.name, msg.user_id);
            self.reply(chat, ACCESS_DENIED).await;
            return;
        }
        match cmd.name.as_str() {
            "start" => self.reply(chat, HELP).await,
            "list" => {
                let text = format!("*Supported OS:*\n```\n{}\n```", escape_code(SUPPORTED_OS));
                if let Err(e) = self.telegram.send_markdown(chat, &text, None).await {
                    log::warn!("bot: sending OS list failed: {}", e);
                }
            }
            "reinstall" => self.propose(chat, cmd.args).await,
            "progress" => self.progress(chat).await,
            _ => {}
        }
    }

    async fn propose(&self, chat: &str, args: Vec<String>) {
        if args.is_empty() {
            self.reply(chat, USAGE).await;
            return;
        }
        let rendered = self.engine.on_command_request(chat, args).await;
        let keyboard = vec![vec![
            InlineButton::new("✅ Continue", CONFIRM_YES),
            InlineButton::new("❌ Cancel", CONFIRM_NO),
        ]];
        if let Err(e) = self
            .telegram
            .send_markdown(chat, &confirmation_prompt(&rendered), Some(keyboard.as_slice()))
            .await
        {
            log::warn!("bot: sending confirmation prompt failed: {}", e);
        }
    }

    async fn progress(&self, chat: &str) {
        let log_path = self.engine.log_path();
        if log_path.exists() {
            let minutes = self.engine.tail_options().timeout.as_secs().div_ceil(60);
            self.reply(
                chat,
                &format!(
                    "Sending tail -f {} (stops automatically after {} minutes).",
                    log_path.display(),
                    minutes
                ),
            )
            .await;
        }
        // A missing log is reported through the session status.
        let _session = self.engine.on_tail_request(chat);
    }

    async fn handle_callback(&self, cb: InboundCallback) {
        if cb.user_id != self.admin_id {
            log::info!("bot: rejected button press from user {}", cb.user_id);
            if let Err(e) = self
                .telegram
                .answer_callback_query(&cb.callback_id, Some(ACCESS_DENIED), true)
                .await
            {
                log::debug!("bot: answerCallbackQuery failed: {}", e);
            }
            return;
        }
        if let Err(e) = self
            .telegram
            .answer_callback_query(&cb.callback_id, None, false)
            .await
        {
            log::debug!("bot: answerCallbackQuery failed: {}", e);
        }
        if !cb.data.starts_with(CONFIRM_PREFIX) {
            return;
        }
        let Some(chat) = cb.conversation_id.as_deref() else {
            return;
        };
        let approve = cb.data == CONFIRM_YES;
        match self.engine.on_confirmation(chat, approve).await {
            Ok(Decision::Running { command, .. }) => {
                let text = format!("Running…\n```\n{}\n```", escape_code(&command.render()));
                self.update_prompt(chat, cb.message_id, &text, true).await;
            }
            Ok(Decision::Cancelled) => {
                self.update_prompt(chat, cb.message_id, "Cancelled.", false)
                    .await
            }
            Err(SessionError::NoPendingCommand) => {
                self.update_prompt(chat, cb.message_id, "No pending command.", false)
                    .await
            }
            Err(e) => {
                let text = render_status(&SessionStatus::Failed(e));
                self.update_prompt(chat, cb.message_id, &text, false).await
            }
        }
    }

    /// Edit the prompt carrying the buttons; fall back to a new message when it is gone.
    async fn update_prompt(&self, chat: &str, message_id: Option<i64>, text: &str, markdown: bool) {
        let edited = match message_id {
            Some(id) => self
                .telegram
                .edit_message_text(chat, id, text, markdown)
                .await
                .map_err(|e| log::debug!("bot: editMessageText failed: {}", e))
                .is_ok(),
            None => false,
        };
        if edited {
            return;
        }
        let sent = if markdown {
            self.telegram.send_markdown(chat, text, None).await.map(|_| ())
        } else {
            self.telegram.send_message(chat, text).await
        };
        if let Err(e) = sent {
            log::warn!("bot: sending update to {} failed: {}", chat, e);
        }
    }
}

/// Run the bot until SIGINT/SIGTERM. Requires a bot token and a non-zero admin id.
pub async fn run_bot(config: Config) -> Result<()> {
    let token = config::resolve_telegram_token(&config);
    let admin_id = config::resolve_admin_id(&config)?;
    let (Some(token), Some(admin_id)) = (token, admin_id) else {
        return Err(anyhow!(
            "set TG_TOKEN and ADMIN_ID in the environment (or telegram.botToken and telegram.adminId in the config) first"
        ));
    };
    let settings = EngineSettings::from_config(&config)?;
    log::info!(
        "script {}, log {}, elevation {:?}",
        settings.script_path.display(),
        settings.log_path.display(),
        settings.elevation
    );
    if !settings.script_path.exists() {
        log::warn!(
            "reinstall script not found at {}; approvals will fail until it exists",
            settings.script_path.display()
        );
    }

    let telegram = Arc::new(TelegramChannel::new(Some(token)));
    if let Err(e) = telegram.drop_pending_updates().await {
        log::warn!("telegram: dropping pending updates failed: {}", e);
    }
    let sink = Arc::new(TelegramSink::new(telegram.clone()));
    let bot = Arc::new(Bot::new(
        telegram.clone(),
        Engine::new(settings, sink),
        admin_id,
    ));

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(64);
    let poll = telegram.clone().start_inbound(inbound_tx);
    let processor = tokio::spawn(async move {
        while let Some(ev) = inbound_rx.recv().await {
            bot.handle(ev).await;
        }
    });
    log::info!("bot running for admin {}", admin_id);

    shutdown_signal().await;
    telegram.stop();
    poll.abort();
    processor.abort();
    log::info!("bot stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}
