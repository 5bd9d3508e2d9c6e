//! Selects a backend from configuration, enforces the pre-DATA reject
//! policy, and routes each message's verdict back into the host's SMTP
//! session.

use tracing::{info, warn};

use crate::{
    config::FilterType, file, pipe, smtp, DispatchError, FilterConfig, Host, SessionContext,
    Verdict,
};

/// Drives one message's data-phase filtering to completion against a
/// configured backend.
pub struct Dispatcher<'a> {
    config: &'a FilterConfig,
}

impl<'a> Dispatcher<'a> {
    pub fn new(config: &'a FilterConfig) -> Dispatcher<'a> {
        Dispatcher { config }
    }

    /// Runs before the client is told to start sending `DATA`.
    pub fn pre_data_hook(&self, ctx: &SessionContext, host: &mut impl Host) {
        if self.config.filter_type == FilterType::Reject {
            info!(status = "REJECTED", "pre-data reject policy in effect");
            host.add_log(ctx, "status", "REJECTED");
            host.fail_msg(ctx, &self.config.reject);
        }
    }

    /// Runs once the client has finished sending `DATA`.
    pub fn data_hook(&self, ctx: &SessionContext, host: &mut impl Host) {
        if self.config.filter_type == FilterType::Reject {
            host.add_log(ctx, "status", "REJECTED");
            host.fail_data(ctx, Some(&self.config.reject));
            return;
        }

        if let Err(e) = host.start_data(ctx) {
            warn!(error = %e, "failed to signal the client to begin DATA");
            host.add_log(ctx, "status", "FILTER-ERROR");
            host.fail_data(ctx, None);
            return;
        }

        if self.config.command.is_none() {
            // Bypass: no filter configured, deliver unchanged.
            if let Err(e) = host.cache_data(ctx) {
                warn!(error = %e, "failed to cache message body for bypass delivery");
                host.add_log(ctx, "status", "FILTER-ERROR");
                host.fail_data(ctx, None);
                return;
            }
            host.add_log(ctx, "status", "FILTERED");
            host.done_data(ctx, self.config.header.as_deref());
            return;
        }

        let result = match self.config.filter_type {
            FilterType::Pipe => pipe::run(ctx, self.config, host),
            FilterType::File => file::run(ctx, self.config, host),
            FilterType::Smtp => smtp::run(ctx, self.config, host),
            FilterType::Reject => unreachable!("handled above"),
        };

        match result {
            Ok(Verdict::Accepted) => {
                host.add_log(ctx, "status", "FILTERED");
                host.done_data(ctx, self.config.header.as_deref());
            }
            Ok(Verdict::Rejected(reason)) => {
                host.add_log(ctx, "status", &reason);
                host.fail_data(ctx, Some(&reason));
            }
            Ok(Verdict::Error) => {
                host.add_log(ctx, "status", "FILTER-ERROR");
                host.fail_data(ctx, None);
            }
            Err(e) => {
                warn!(error = %e, status = %e.status(), "data-phase filter failed");
                host.add_log(ctx, "status", &e.status());
                match e.to_verdict() {
                    Verdict::Rejected(reason) => host.fail_data(ctx, Some(&reason)),
                    _ => host.fail_data(ctx, None),
                }
            }
        }
    }
}
