use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_rows_per_block_never_zero() {
    assert_eq!(rows_per_block(0), 1);
    assert!(rows_per_block(1) >= 1);
    let threads = rayon::current_num_threads();
    assert_eq!(rows_per_block(threads * 4), 4);
}

#[test]
fn test_par_blocks_offsets() {
    let width = 10;
    let height = 23;
    let mut data: Vec<usize> = vec![0; width * height];

    rows(&mut data, width)
        .par_blocks()
        .for_each(|(first_row, block)| {
            assert_eq!(block.len() % width, 0, "Block not row-aligned");
            for (local, row) in block.chunks_mut(width).enumerate() {
                for (x, v) in row.iter_mut().enumerate() {
                    *v = (first_row + local) * width + x;
                }
            }
        });

    for (i, &v) in data.iter().enumerate() {
        assert_eq!(v, i);
    }
}

#[test]
fn test_par_blocks_empty() {
    let mut data: Vec<u8> = Vec::new();
    let count = rows(&mut data, 4).par_blocks().count();
    assert_eq!(count, 0);
}

#[test]
#[should_panic(expected = "row_len must be > 0")]
fn test_rows_zero_len_panics() {
    let mut data = vec![0u8; 4];
    rows(&mut data, 0);
}

#[test]
fn test_zip_two_views_with_different_row_lengths() {
    let height = 17;
    let mut wide: Vec<u32> = vec![0; height * 6];
    let mut narrow: Vec<u32> = vec![0; height * 2];

    rows(&mut wide, 6)
        .zip(rows(&mut narrow, 2))
        .par_blocks()
        .for_each(|(first_row, (a, b))| {
            assert_eq!(a.len() / 6, b.len() / 2);
            for (local, row) in a.chunks_mut(6).enumerate() {
                row.fill((first_row + local) as u32);
            }
            for (local, row) in b.chunks_mut(2).enumerate() {
                row.fill((first_row + local) as u32 * 10);
            }
        });

    for y in 0..height {
        assert!(wide[y * 6..(y + 1) * 6].iter().all(|&v| v == y as u32));
        assert!(narrow[y * 2..(y + 1) * 2].iter().all(|&v| v == y as u32 * 10));
    }
}

#[test]
fn test_zip_three_views() {
    let height = 9;
    let mut a = vec![0.0f32; height * 3];
    let mut b = vec![0usize; height];
    let mut c = vec![0.0f64; height];

    rows(&mut a, 3)
        .zip(rows(&mut b, 1))
        .zip(rows(&mut c, 1))
        .par_blocks()
        .for_each(|(first_row, (a, b, c))| {
            for (local, v) in b.iter_mut().enumerate() {
                *v = first_row + local;
            }
            c.fill(1.0);
            a.fill(2.0);
        });

    assert_eq!(b, (0..height).collect::<Vec<_>>());
    assert!(c.iter().all(|&v| v == 1.0));
    assert!(a.iter().all(|&v| v == 2.0));
}

#[test]
#[should_panic(expected = "equal height")]
fn test_zip_height_mismatch_panics() {
    let mut a = vec![0u8; 6];
    let mut b = vec![0u8; 4];
    rows(&mut a, 2).zip(rows(&mut b, 2));
}

// ========== Bounded map ==========

#[test]
fn test_try_par_map_limited_preserves_order() {
    let items: Vec<i32> = (0..50).collect();
    let result: Result<Vec<i32>, &str> =
        try_par_map_limited(&items, 4, |_| Ok(()), |&x| Ok(x * 2));
    assert_eq!(result.unwrap(), (0..50).map(|x| x * 2).collect::<Vec<_>>());
}

#[test]
fn test_try_par_map_limited_err() {
    let items: Vec<i32> = (0..10).collect();
    let result: Result<Vec<i32>, String> = try_par_map_limited(
        &items,
        3,
        |_| Ok(()),
        |&x| if x == 5 { Err("bad".to_string()) } else { Ok(x) },
    );
    assert_eq!(result.unwrap_err(), "bad");
}

#[test]
fn test_try_par_map_limited_between_batches_aborts() {
    let items: Vec<i32> = (0..10).collect();
    let processed = AtomicUsize::new(0);
    let result: Result<Vec<i32>, &str> = try_par_map_limited(
        &items,
        3,
        |done| if done >= 6 { Err("stop") } else { Ok(()) },
        |&x| {
            processed.fetch_add(1, Ordering::SeqCst);
            Ok(x)
        },
    );
    assert_eq!(result.unwrap_err(), "stop");
    assert_eq!(processed.load(Ordering::SeqCst), 6);
}

#[test]
fn test_try_par_map_limited_concurrency_cap() {
    let items: Vec<i32> = (0..20).collect();
    let in_flight = AtomicUsize::new(0);
    let max_observed = AtomicUsize::new(0);

    let _: Result<Vec<i32>, ()> = try_par_map_limited(
        &items,
        3,
        |_| Ok(()),
        |&x| {
            let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_observed.fetch_max(current, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(2));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(x)
        },
    );

    let max = max_observed.load(Ordering::SeqCst);
    assert!(max <= 3, "max in-flight was {max}, expected <= 3");
}

#[test]
#[should_panic(expected = "max_concurrent must be > 0")]
fn test_try_par_map_limited_zero_panics() {
    let _: Result<Vec<i32>, ()> = try_par_map_limited(&[1, 2, 3], 0, |_| Ok(()), |&x| Ok(x));
}
