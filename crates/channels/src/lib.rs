//! Channel plugin contract.
//!
//! A channel (DingTalk today) implements [`ChannelPlugin`] plus the optional
//! adapter traits for outbound sends, status, pairing, security warnings and
//! onboarding. The host implements [`ChannelHost`] and hands each inbound
//! message's reply sink to the plugin as a [`ReplyDispatcher`].

pub mod error;
pub mod gating;
pub mod host;
pub mod plugin;

pub use {
    error::{Error, Result},
    host::{
        AgentRoute, ChannelHost, DispatchOutcome, EnvelopeParams, InboundContext, PeerKind,
        QueuedCounts, ReplyDispatcher, ReplyKind, ReplyPayload, RoutePeer, RouteRequest,
        SystemEventOptions,
    },
    plugin::{
        AccountSnapshot, ChannelCapabilities, ChannelHealthSnapshot, ChannelMeta,
        ChannelOnboarding, ChannelOutbound, ChannelPairing, ChannelPlugin, ChannelSecurity,
        ChannelStatus, ChatType, OnboardingField, OnboardingFieldKind, OnboardingStep,
        PAIRING_APPROVED_MESSAGE, ToolPolicy,
    },
};
