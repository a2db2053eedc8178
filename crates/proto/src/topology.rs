//! Stream tree navigation.
//!
//! Stream `1` is the root, stream `s` has parent `s / 2` and children `2s`
//! and `2s + 1`. Stream `0` does not exist; every function returns an empty
//! result for it.

pub type StreamId = u32;

pub fn parent(stream: StreamId) -> Option<StreamId> {
    (stream > 1).then_some(stream / 2)
}

/// Child streams, or `None` when they would not fit in a `StreamId`.
pub fn children(stream: StreamId) -> Option<[StreamId; 2]> {
    let left = stream.checked_mul(2)?;
    let right = left.checked_add(1)?;
    (stream != 0).then_some([left, right])
}

/// `stream` together with its parent and children.
pub fn perimeter(stream: StreamId) -> Vec<StreamId> {
    if stream == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(4);
    out.extend(parent(stream));
    out.push(stream);
    out.extend(children(stream).into_iter().flatten());
    out
}

/// Sorted union of the perimeters of `streams`.
pub fn perimeter_of(streams: &[StreamId]) -> Vec<StreamId> {
    let mut out: Vec<StreamId> = streams.iter().flat_map(|s| perimeter(*s)).collect();
    out.sort_unstable();
    out.dedup();
    out
}

pub fn is_adjacent(a: StreamId, b: StreamId) -> bool {
    a != 0 && b != 0 && (parent(a) == Some(b) || parent(b) == Some(a))
}

fn depth(stream: StreamId) -> u32 {
    StreamId::BITS - stream.leading_zeros()
}

fn bit_at(stream: StreamId, depth_of_stream: u32, index: u32) -> u32 {
    (stream >> (depth_of_stream - 1 - index)) & 1
}

/// Streams visited walking the tree from `start` to `target`, both included.
///
/// The walk climbs to the deepest common ancestor, found by comparing the
/// binary representations from the most significant bit, then descends by
/// following the remaining bits of `target`.
pub fn path(start: StreamId, target: StreamId) -> Vec<StreamId> {
    if start == 0 || target == 0 {
        return Vec::new();
    }
    let start_depth = depth(start);
    let target_depth = depth(target);
    let mut common = 0;
    while common < start_depth.min(target_depth)
        && bit_at(start, start_depth, common) == bit_at(target, target_depth, common)
    {
        common += 1;
    }

    let mut route = vec![start];
    let mut current = start;
    for _ in common..start_depth {
        current /= 2;
        route.push(current);
    }
    for index in common..target_depth {
        current = current * 2 + bit_at(target, target_depth, index);
        route.push(current);
    }
    route
}
