//! Alert policy for device notifications.
//!
//! A notification always interrupts the user. When the filter is off, the
//! policy also asks for an automatic filter activation, which the state
//! machine applies right away; acknowledging the interrupt only dismisses
//! the dialog, it gates nothing.

use hush_wire::Notification;
use std::fmt;

/// What to do with a device notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertDecision {
    /// Raise a blocking interrupt
    pub must_interrupt: bool,
    /// Turn the filter on with an automatic origin
    pub auto_enable_filter: bool,
}

/// Decides the client reaction to threshold-breach notifications
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertPolicy;

impl AlertPolicy {
    /// Evaluate a notification against the current filter state
    pub fn on_notification(&self, _notification: &Notification, filter_active: bool) -> AlertDecision {
        AlertDecision {
            must_interrupt: true,
            auto_enable_filter: !filter_active,
        }
    }
}

/// Blocking, non-cancelable message for the user
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    /// The device reported a threshold breach
    ThresholdBreach {
        /// Level reported by the device
        level: f64,
        /// Threshold reported by the device
        threshold: f64,
        /// Whether this notification switched the filter on
        filter_auto_enabled: bool,
    },
    /// The link reported an error
    ConnectionFailure {
        /// Error text
        reason: String,
    },
}

impl Interrupt {
    /// Dialog title
    pub fn title(&self) -> &'static str {
        match self {
            Interrupt::ThresholdBreach { .. } => "Noise threshold exceeded",
            Interrupt::ConnectionFailure { .. } => "Connection problem",
        }
    }

    /// Dialog body
    pub fn body(&self) -> String {
        match self {
            Interrupt::ThresholdBreach {
                level,
                threshold,
                filter_auto_enabled,
            } => {
                let mut body = format!(
                    "Measured {:.1} dB(A), above the {:.1} dB(A) threshold.",
                    level, threshold
                );
                if *filter_auto_enabled {
                    body.push_str(" The filter has been enabled.");
                }
                body
            }
            Interrupt::ConnectionFailure { reason } => format!(
                "Could not talk to the device ({}).\n\
                 Common causes:\n\
                 - the server is not running\n\
                 - the device is switched off\n\
                 - phone and device are on different networks\n\
                 - the configured address is wrong",
                reason
            ),
        }
    }

    /// Label of the single acknowledgment action
    pub fn ack_label(&self) -> &'static str {
        "OK"
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title(), self.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breach() -> Notification {
        Notification {
            level: 72.0,
            threshold: 70.0,
        }
    }

    #[test]
    fn test_notification_with_filter_off_enables_filter() {
        let decision = AlertPolicy.on_notification(&breach(), false);
        assert!(decision.must_interrupt);
        assert!(decision.auto_enable_filter);
    }

    #[test]
    fn test_notification_with_filter_on_only_interrupts() {
        let decision = AlertPolicy.on_notification(&breach(), true);
        assert!(decision.must_interrupt);
        assert!(!decision.auto_enable_filter);
    }

    #[test]
    fn test_interrupt_text() {
        let interrupt = Interrupt::ThresholdBreach {
            level: 72.0,
            threshold: 70.0,
            filter_auto_enabled: true,
        };
        assert_eq!(interrupt.title(), "Noise threshold exceeded");
        assert!(interrupt.body().contains("72.0 dB(A)"));
        assert!(interrupt.body().contains("70.0 dB(A)"));
        assert!(interrupt.body().contains("The filter has been enabled."));

        let interrupt = Interrupt::ConnectionFailure {
            reason: "connection refused".to_string(),
        };
        assert!(interrupt.body().contains("connection refused"));
        assert!(interrupt.body().contains("server is not running"));
        assert_eq!(interrupt.ack_label(), "OK");
    }

    #[test]
    fn test_breach_with_filter_already_on_does_not_claim_activation() {
        let interrupt = Interrupt::ThresholdBreach {
            level: 72.0,
            threshold: 70.0,
            filter_auto_enabled: false,
        };
        assert_eq!(
            interrupt.body(),
            "Measured 72.0 dB(A), above the 70.0 dB(A) threshold."
        );
    }
}
