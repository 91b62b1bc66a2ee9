use std::{net::TcpListener, thread};

use comms::{
    Collective, Deserialize, ReduceOp, Serialize, TcpGroup,
    msg::{Command, Msg},
};
use tokio::io;

struct MyStr<'a>(&'a str);

impl<'a> Serialize<'a> for MyStr<'_> {
    fn serialize(&'a self, _buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        Some(self.0.as_bytes())
    }
}

impl<'a> Deserialize<'a> for MyStr<'a> {
    fn deserialize(buf: &'a mut [u8]) -> std::io::Result<Self> {
        str::from_utf8(buf)
            .map(Self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[tokio::test]
async fn send_recv() {
    const SIZE: usize = 128;

    let msg = MyStr("Hello, world!");

    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    tx.send(&msg).await.unwrap();

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut buf: Vec<u32> = Vec::new();
    let s: MyStr = rx.recv_into(&mut buf).await.unwrap();

    assert_eq!(msg.0, s.0);
}

#[tokio::test]
async fn frames_keep_boundaries() {
    let (one, two) = io::duplex(1024);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let params = [0.5f32, 1.5, -3.0];
    tx.send(&Msg::Control(Command::Disconnect)).await.unwrap();
    tx.send(&Msg::Data(&params)).await.unwrap();

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);
    let mut buf: Vec<f32> = Vec::new();

    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Control(Command::Disconnect) => {}
        other => panic!("unexpected msg: {other:?}"),
    }

    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Data(got) => assert_eq!(got, &params[..]),
        other => panic!("unexpected msg: {other:?}"),
    }
}

#[test]
fn tcp_group_runs_collectives() {
    const WORLD_SIZE: usize = 3;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let results = thread::scope(|s| {
        let hub = s.spawn(move || TcpGroup::host(listener, WORLD_SIZE).unwrap());
        let spokes: Vec<_> = (1..WORLD_SIZE)
            .map(|rank| s.spawn(move || TcpGroup::join(addr, rank, WORLD_SIZE).unwrap()))
            .collect();

        let mut groups = vec![hub.join().unwrap()];
        groups.extend(spokes.into_iter().map(|h| h.join().unwrap()));

        let handles: Vec<_> = groups
            .into_iter()
            .map(|mut group| {
                s.spawn(move || {
                    let rank = group.rank() as f32;

                    let gathered = group.all_gather(&[rank]).unwrap();
                    let input = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0].map(|v| v * (rank + 1.0));
                    let shard = group.reduce_scatter(ReduceOp::Sum, &input, WORLD_SIZE).unwrap();

                    let mut max = [rank];
                    group.all_reduce(ReduceOp::Max, &mut max).unwrap();

                    (gathered, shard, max[0])
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    let expected_shards = [vec![6.0, 12.0], vec![18.0, 24.0], vec![30.0, 36.0]];
    for (rank, (gathered, shard, max)) in results.into_iter().enumerate() {
        assert_eq!(gathered, vec![0.0, 1.0, 2.0]);
        assert_eq!(shard, expected_shards[rank]);
        assert_eq!(max, 2.0);
    }
}
