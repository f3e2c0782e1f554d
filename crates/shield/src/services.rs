//! Production adapters wired from configuration

use shield_core::{
    accounting::SacctAccounting,
    clock::SystemClock,
    enforcement::{resolver_for, AddressBook, ScancelTerminator, SendmailNotifier},
    pipeline::Services,
    telemetry::CommandTelemetry,
    ShieldConfig,
};
use std::sync::Arc;
use std::time::Duration;

pub fn build(config: &ShieldConfig) -> Services {
    let timeout = Duration::from_secs(config.command_timeout_secs);
    Services {
        accounting: Arc::new(SacctAccounting::new(
            &config.sacct_path,
            timeout,
            config.partition_renamings.clone(),
        )),
        telemetry: Arc::new(CommandTelemetry::new(config.telemetry.clone())),
        notifier: Arc::new(SendmailNotifier::new(
            &config.sendmail_path,
            &config.sender,
            config.reply_to.clone(),
            timeout,
        )),
        terminator: Arc::new(ScancelTerminator::new(&config.scancel_path, timeout)),
        names: Arc::from(resolver_for(
            config.greeting_method,
            config.custom_greeting.as_deref(),
        )),
        clock: Arc::new(SystemClock),
    }
}

pub fn address_book(config: &ShieldConfig) -> AddressBook {
    AddressBook::new(
        config.email_domain_name.clone(),
        config.external_emails.clone(),
    )
}
