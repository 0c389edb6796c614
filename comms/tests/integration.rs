use comms::{
    Wire,
    msg::{Command, Msg, Payload},
};
use tokio::io::{self, AsyncWriteExt};

#[tokio::test]
async fn control_message_crosses_the_wire() {
    let (near, far) = io::duplex(128);
    let mut sender = Wire::new(near);
    let mut receiver = Wire::new(far);

    let msg = Msg::Control(Command::Join {
        rank: 1,
        world_size: 2,
    });
    sender.send(&msg).await.unwrap();

    let got = receiver.recv().await.unwrap();
    assert_eq!(got, msg);
}

#[tokio::test]
async fn payloads_sent_back_to_back_arrive_in_order() {
    let (near, far) = io::duplex(4096);
    let mut sender = Wire::new(near);
    let mut receiver = Wire::new(far);

    let first = [0.5_f32, 1.5, 2.5];
    let second = [-1.0_f32; 7];
    sender.send(&Msg::Data(Payload::Contribution(&first))).await.unwrap();
    sender.send(&Msg::Data(Payload::Reduced(&second))).await.unwrap();

    match receiver.recv().await.unwrap() {
        Msg::Data(Payload::Contribution(nums)) => assert_eq!(nums, first),
        other => panic!("unexpected message {}", other.kind()),
    }

    match receiver.recv().await.unwrap() {
        Msg::Data(Payload::Reduced(nums)) => assert_eq!(nums, second),
        other => panic!("unexpected message {}", other.kind()),
    }
}

#[tokio::test]
async fn both_ends_can_talk_over_one_stream() {
    let (near, far) = io::duplex(256);
    let mut root = Wire::new(near);
    let mut peer = Wire::new(far);

    peer.send(&Msg::Control(Command::Barrier)).await.unwrap();
    assert_eq!(root.recv().await.unwrap(), Msg::Control(Command::Barrier));

    root.send(&Msg::Control(Command::Release)).await.unwrap();
    assert_eq!(peer.recv().await.unwrap(), Msg::Control(Command::Release));
}

#[tokio::test]
async fn truncated_frame_is_an_error() {
    let (mut near, far) = io::duplex(64);
    let mut receiver = Wire::new(far);

    near.write_all(&16u32.to_be_bytes()).await.unwrap();
    near.write_all(&2u32.to_be_bytes()).await.unwrap();
    drop(near);

    let err = receiver.recv().await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
}
