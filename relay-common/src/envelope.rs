use serde::{Deserialize, Serialize};

use crate::address::{Address, AddressList};

/// Body encoding declared on `MAIL FROM` via the BODY parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
}

/// Parameters attached to `MAIL FROM`, per RFC 1870 (SIZE) and RFC 6152
/// (BODY), plus the SASL identity carried by the AUTH parameter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailParameters {
    /// Declared message size in octets, from `SIZE=`.
    pub size: Option<usize>,

    /// Declared body encoding, from `BODY=`.
    pub body: Option<BodyType>,

    /// Authorization identity forwarded by a relaying MTA, from `AUTH=`.
    pub auth: Option<String>,
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    sender: Option<Address>,
    recipients: Option<AddressList>,
    mail_params: Option<MailParameters>,
}

impl Envelope {
    /// Returns a reference to the [`Envelope`] sender for this message
    #[inline]
    #[must_use]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    /// Returns a mutable reference to the [`Envelope`] sender for this message
    #[inline]
    pub const fn sender_mut(&mut self) -> &mut Option<Address> {
        &mut self.sender
    }

    /// Returns a reference to the [`Envelope`] recipients for this message
    #[inline]
    #[must_use]
    pub const fn recipients(&self) -> Option<&AddressList> {
        self.recipients.as_ref()
    }

    /// Returns a mutable reference to the [`Envelope`] recipients for this message
    #[inline]
    pub const fn recipients_mut(&mut self) -> &mut Option<AddressList> {
        &mut self.recipients
    }

    /// Returns a reference to the `MAIL FROM` parameters for this message
    #[inline]
    #[must_use]
    pub const fn mail_params(&self) -> Option<&MailParameters> {
        self.mail_params.as_ref()
    }

    /// Returns a mutable reference to the `MAIL FROM` parameters for this message
    #[inline]
    pub const fn mail_params_mut(&mut self) -> &mut Option<MailParameters> {
        &mut self.mail_params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_envelope_is_empty() {
        let envelope = Envelope::default();
        assert!(envelope.sender().is_none());
        assert!(envelope.recipients().is_none());
        assert!(envelope.mail_params().is_none());
    }

    #[test]
    fn mail_params_round_trip_through_mut() {
        let mut envelope = Envelope::default();
        *envelope.mail_params_mut() = Some(MailParameters {
            size: Some(1024),
            body: Some(BodyType::EightBitMime),
            auth: None,
        });

        let params = envelope.mail_params().expect("params set");
        assert_eq!(params.size, Some(1024));
        assert_eq!(params.body, Some(BodyType::EightBitMime));
    }
}
