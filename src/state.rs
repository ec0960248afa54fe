use std::{sync::Arc, time::Duration};

use crate::config::AppConfig;
use crate::mail::{LogMailer, MailSender, SmtpMailer};
use crate::users::{MemoryUserStore, PgUserStore, UserStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserStore>,
    pub mailer: Arc<dyn MailSender>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let users: Arc<dyn UserStore> = match config.database_url.as_deref() {
            Some(url) => {
                let db = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(config.db_max_connections)
                    .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
                    .connect(url)
                    .await?;

                if let Err(e) = sqlx::migrate!("./migrations").run(&db).await {
                    tracing::warn!(error = %e, "migration failed; continuing");
                }
                Arc::new(PgUserStore::new(db))
            }
            None => {
                tracing::warn!("DATABASE_URL not set; users are kept in memory");
                Arc::new(MemoryUserStore::new())
            }
        };

        let mailer: Arc<dyn MailSender> = if config.mail.is_configured() {
            Arc::new(SmtpMailer::new(&config.mail)?)
        } else {
            tracing::warn!("EMAIL_HOST not set; outgoing mail is only logged");
            Arc::new(LogMailer)
        };

        Ok(Self {
            config,
            users,
            mailer,
        })
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserStore>,
        mailer: Arc<dyn MailSender>,
    ) -> Self {
        Self {
            config,
            users,
            mailer,
        }
    }

    /// In-memory state with the test configuration.
    #[cfg(test)]
    pub fn fake() -> Self {
        Self::from_parts(
            Arc::new(AppConfig::for_tests()),
            Arc::new(MemoryUserStore::new()),
            Arc::new(LogMailer),
        )
    }
}
