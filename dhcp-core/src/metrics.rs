#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! contains statistics for server metrics
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum MsgType {
        discover,
        request,
        decline,
        release,
        offer,
        ack,
        nak,
        inform,
        unknown,
    }
    pub struct RecvStats: IntCounter {
        "message_type" => MsgType
    }
    pub struct SentStats: IntCounter {
        "message_type" => MsgType
    }
    pub label_enum V6MsgType {
        solicit,
        advertise,
        request,
        renew,
        reply,
        release,
        unknown,
    }
    pub struct V6RecvStats: IntCounter {
        "v6_message_type" => V6MsgType
    }
    pub struct V6SentStats: IntCounter {
        "v6_message_type" => V6MsgType
    }
}

lazy_static! {
    /// handlers currently processing a message
    pub static ref IN_FLIGHT: IntGauge =
        register_int_gauge!("dhcp_in_flight", "handlers currently processing").unwrap();

    /// messages the ingress pipeline dropped before a handler ran
    pub static ref INGRESS_DROPPED: IntCounter =
        register_int_counter!("dhcp_ingress_dropped", "undecodable ingress messages").unwrap();

    pub static ref RECV_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "recv_type_counts",
        "Recv Type Counts",
        &["message_type"]
    )
    .unwrap();
    pub static ref SENT_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "sent_type_counts",
        "Sent Type Counts",
        &["message_type"]
    )
    .unwrap();

    /// aggregate count of all recv'd messages types
    pub static ref RECV_TYPE_COUNT: RecvStats = RecvStats::from(&RECV_COUNT_VEC);

    /// aggregate count of all sent messages types
    pub static ref SENT_TYPE_COUNT: SentStats = SentStats::from(&SENT_COUNT_VEC);

    pub static ref V6_RECV_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "v6_recv_type_counts",
        "V6 Recv Type Counts",
        &["v6_message_type"]
    )
    .unwrap();
    pub static ref V6_SENT_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "v6_sent_type_counts",
        "V6 Sent Type Counts",
        &["v6_message_type"]
    )
    .unwrap();

    /// aggregate count of all recv'd v6 messages types
    pub static ref V6_RECV_TYPE_COUNT: V6RecvStats = V6RecvStats::from(&V6_RECV_COUNT_VEC);

    /// aggregate count of all sent v6 messages types
    pub static ref V6_SENT_TYPE_COUNT: V6SentStats = V6SentStats::from(&V6_SENT_COUNT_VEC);
}

use dhcproto::{v4, v6};

/// count one received v4 message
pub fn recv_v4(mtype: v4::MessageType) {
    match mtype {
        v4::MessageType::Discover => RECV_TYPE_COUNT.discover.inc(),
        v4::MessageType::Request => RECV_TYPE_COUNT.request.inc(),
        v4::MessageType::Decline => RECV_TYPE_COUNT.decline.inc(),
        v4::MessageType::Release => RECV_TYPE_COUNT.release.inc(),
        v4::MessageType::Inform => RECV_TYPE_COUNT.inform.inc(),
        _ => RECV_TYPE_COUNT.unknown.inc(),
    }
}

/// count one sent v4 message
pub fn sent_v4(mtype: v4::MessageType) {
    match mtype {
        v4::MessageType::Offer => SENT_TYPE_COUNT.offer.inc(),
        v4::MessageType::Ack => SENT_TYPE_COUNT.ack.inc(),
        v4::MessageType::Nak => SENT_TYPE_COUNT.nak.inc(),
        _ => SENT_TYPE_COUNT.unknown.inc(),
    }
}

/// count one received v6 message
pub fn recv_v6(mtype: v6::MessageType) {
    match mtype {
        v6::MessageType::Solicit => V6_RECV_TYPE_COUNT.solicit.inc(),
        v6::MessageType::Request => V6_RECV_TYPE_COUNT.request.inc(),
        v6::MessageType::Renew => V6_RECV_TYPE_COUNT.renew.inc(),
        v6::MessageType::Release => V6_RECV_TYPE_COUNT.release.inc(),
        _ => V6_RECV_TYPE_COUNT.unknown.inc(),
    }
}

/// count one sent v6 message
pub fn sent_v6(mtype: v6::MessageType) {
    match mtype {
        v6::MessageType::Advertise => V6_SENT_TYPE_COUNT.advertise.inc(),
        v6::MessageType::Reply => V6_SENT_TYPE_COUNT.reply.inc(),
        _ => V6_SENT_TYPE_COUNT.unknown.inc(),
    }
}
