//! Handling of bus traffic addressed to a device other than this one.
//!
//! Two independent switches feed two separate checkpoints: whether a token is accepted at all
//! (and what an interrupt poll is offered) is decided when the token arrives, while whether a
//! data packet for a foreign address may actually leave the transmitter is decided again just
//! before the line is driven.
//!
//! | inject | deny_of_service | foreign interrupt poll                         |
//! |--------|-----------------|------------------------------------------------|
//! | 0      | 0               | NAK                                            |
//! | 0      | 1               | data offered, then withdrawn at send time      |
//! | 1      | 0               | NAK                                            |
//! | 1      | 1               | real report data                               |

use crate::INTERRUPT_ENDPOINT;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InjectionPolicy {
    /// permit transmitting data on behalf of a foreign address
    pub inject: bool,
    /// answer a foreign interrupt poll with data instead of a NAK
    pub deny_of_service: bool,
}

/// What an accepted IN token on the interrupt endpoint gets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterruptOffer {
    Nak,
    Data,
}

impl InjectionPolicy {
    pub fn new(inject: bool, deny_of_service: bool) -> Self { InjectionPolicy { inject, deny_of_service } }

    /// Address gate for tokens. A token to another address is still taken when it targets the
    /// interrupt endpoint.
    pub fn accepts_token(&self, own_address: u8, address: u8, endpoint: u8) -> bool {
        address == own_address || endpoint == INTERRUPT_ENDPOINT
    }

    pub fn interrupt_offer(
        &self,
        own_address: u8,
        address: u8,
        nak_interrupt_polling: bool,
    ) -> InterruptOffer {
        if nak_interrupt_polling {
            InterruptOffer::Nak
        } else if address != own_address && !self.deny_of_service {
            InterruptOffer::Nak
        } else {
            InterruptOffer::Data
        }
    }

    /// Send-time gate for data packets.
    pub fn permits_send(&self, own_address: u8, target: u8) -> bool { self.inject || target == own_address }
}
