//! End-to-end checks for the UDP ingress: datagrams either reach the
//! streaming source or are filtered out, and the receiver restarts cleanly
//! on the same port.

use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSrc};
use pixelpilot_mini_rk::ingress::UdpReceiver;
use std::net::UdpSocket;

/// A minimal live source graph: whatever the receiver pushes into the appsrc
/// surfaces on the appsink.
fn source_graph() -> (gstreamer::Pipeline, AppSrc, AppSink) {
    gstreamer::init().unwrap();
    let pipeline = gstreamer::Pipeline::with_name("ingress_test");
    let appsrc = AppSrc::builder().format(gstreamer::Format::Time).build();
    let appsink = AppSink::builder().build();
    appsink.set_max_buffers(16);
    appsink.set_drop(true);
    appsink.set_property("sync", false);
    pipeline
        .add_many([appsrc.upcast_ref(), appsink.upcast_ref()])
        .unwrap();
    appsrc.link(&appsink).unwrap();
    pipeline.set_state(gstreamer::State::Playing).unwrap();
    (pipeline, appsrc, appsink)
}

fn rtp_datagram(pt: u8, len: usize) -> Vec<u8> {
    let mut datagram = vec![0u8; len];
    datagram[0] = 0x80;
    datagram[1] = pt & 0x7f;
    datagram
}

#[test]
fn matching_payload_type_reaches_the_source() {
    let (pipeline, appsrc, appsink) = source_graph();
    let mut receiver = UdpReceiver::new(0, 97, appsrc);
    receiver.start().unwrap();
    let port = receiver.local_port().unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let datagram = rtp_datagram(97, 200);
    sender.send_to(&datagram, ("127.0.0.1", port)).unwrap();

    let sample = appsink
        .try_pull_sample(gstreamer::ClockTime::from_seconds(3))
        .expect("datagram did not reach the appsink");
    let buffer = sample.buffer().unwrap();
    let map = buffer.map_readable().unwrap();
    assert_eq!(map.as_slice(), datagram.as_slice());

    receiver.stop();
    pipeline.set_state(gstreamer::State::Null).unwrap();
}

#[test]
fn mismatched_payload_type_is_dropped() {
    let (pipeline, appsrc, appsink) = source_graph();
    let mut receiver = UdpReceiver::new(0, 97, appsrc);
    receiver.start().unwrap();
    let port = receiver.local_port().unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    // PT 96, then PT 97: only the second may surface.
    sender
        .send_to(&rtp_datagram(96, 128), ("127.0.0.1", port))
        .unwrap();
    let expected = rtp_datagram(97, 64);
    sender.send_to(&expected, ("127.0.0.1", port)).unwrap();

    let sample = appsink
        .try_pull_sample(gstreamer::ClockTime::from_seconds(3))
        .expect("matching datagram did not arrive");
    let buffer = sample.buffer().unwrap();
    let map = buffer.map_readable().unwrap();
    assert_eq!(map.as_slice(), expected.as_slice());
    assert!(appsink
        .try_pull_sample(gstreamer::ClockTime::from_mseconds(200))
        .is_none());
    let stats = receiver.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.dropped, 1);

    receiver.stop();
    pipeline.set_state(gstreamer::State::Null).unwrap();
}

#[test]
fn zero_length_datagrams_are_dropped() {
    let (pipeline, appsrc, appsink) = source_graph();
    let mut receiver = UdpReceiver::new(0, -1, appsrc);
    receiver.start().unwrap();
    let port = receiver.local_port().unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(&[], ("127.0.0.1", port)).unwrap();
    let expected = rtp_datagram(96, 32);
    sender.send_to(&expected, ("127.0.0.1", port)).unwrap();

    // Wildcard payload type accepts any PT, but never an empty datagram.
    let sample = appsink
        .try_pull_sample(gstreamer::ClockTime::from_seconds(3))
        .expect("non-empty datagram did not arrive");
    let buffer = sample.buffer().unwrap();
    let map = buffer.map_readable().unwrap();
    assert_eq!(map.as_slice(), expected.as_slice());
    assert!(appsink
        .try_pull_sample(gstreamer::ClockTime::from_mseconds(200))
        .is_none());
    let stats = receiver.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.dropped, 1);

    receiver.stop();
    pipeline.set_state(gstreamer::State::Null).unwrap();
}

#[test]
fn receiver_rebinds_after_stop() {
    let (pipeline, appsrc, appsink) = source_graph();
    let mut first = UdpReceiver::new(0, 97, appsrc.clone());
    first.start().unwrap();
    let port = first.local_port().unwrap();
    first.stop();

    let mut second = UdpReceiver::new(port, 97, appsrc);
    second.start().expect("rebind on the same port failed");

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let datagram = rtp_datagram(97, 48);
    sender.send_to(&datagram, ("127.0.0.1", port)).unwrap();
    assert!(appsink
        .try_pull_sample(gstreamer::ClockTime::from_seconds(3))
        .is_some());

    second.stop();
    pipeline.set_state(gstreamer::State::Null).unwrap();
}
