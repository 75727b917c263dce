/// Text mapping for enums stored as TEXT columns.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> anyhow::Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow::anyhow!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    )),
                }
            }
        }
    };
}

pub mod config;
pub mod domain {
    pub mod context;
    pub mod idempotency;
    pub mod intent;
    pub mod ledger;
    pub mod outbox;
    pub mod payment;
    pub mod refund;
    pub mod risk;
    pub mod webhook;
}
pub mod error;
pub mod http {
    pub mod handlers {
        pub mod ops;
    }
}
pub mod rail;
pub mod repo {
    pub mod idempotency_repo;
    pub mod idempotency_store_redis;
    pub mod ledger_repo;
    pub mod memory;
    pub mod outbox_repo;
    pub mod payments_repo;
    pub mod refunds_repo;
    pub mod risk_repo;
    pub mod store;
    pub mod webhook_repo;
}
pub mod risk {
    pub mod engine;
    pub mod history_reader;
    pub mod types;
}
pub mod service {
    pub mod idempotency_service;
    pub mod ledger_reconciler;
    pub mod ledger_service;
    pub mod outbox_relay;
    pub mod payment_service;
    pub mod refund_service;
    pub mod risk_service;
    pub mod status_poller;
    pub mod webhook_dispatcher;
}

#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::PgPool,
    pub redis_client: Option<redis::Client>,
}
