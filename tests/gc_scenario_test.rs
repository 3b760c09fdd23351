// 内存预算回收器场景测试
//
// 测试内容：
// 1. 预算 10 → 3：只驱逐最久未访问的一个对象
// 2. 预算 0：全部驱逐
// 3. 按访问时间 (而非入队顺序) 驱逐，重新入队不重复
// 4. enqueue / dequeue 幂等
// 5. 随机访问时间下的驱逐顺序 (proptest)

use chunkflow::{Collectable, GarbageCollector, GcSlot};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// 单位代价的测试对象：释放时归还 1 个单位
struct UnitObject {
    id: u64,
    access: AtomicU64,
    released: AtomicBool,
    slot: GcSlot,
    gc: Weak<GarbageCollector<UnitObject>>,
}

impl UnitObject {
    fn create(gc: &Arc<GarbageCollector<UnitObject>>, id: u64, access: u64) -> Arc<Self> {
        gc.update_memory_usage(1);
        Arc::new(Self {
            id,
            access: AtomicU64::new(access),
            released: AtomicBool::new(false),
            slot: GcSlot::new(),
            gc: Arc::downgrade(gc),
        })
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Collectable for UnitObject {
    fn gc_id(&self) -> u64 {
        self.id
    }

    fn last_access(&self) -> u64 {
        self.access.load(Ordering::SeqCst)
    }

    fn can_free(&self) -> bool {
        !self.is_released()
    }

    fn gc_slot(&self) -> &GcSlot {
        &self.slot
    }

    fn release(&self) {
        assert!(!self.released.swap(true, Ordering::SeqCst), "double release");
        if let Some(gc) = self.gc.upgrade() {
            gc.update_memory_usage(-1);
        }
    }
}

/// 四个单位对象 O0..O3，访问时间 1..=4，全部入队
fn four_objects(limit: u64) -> (Arc<GarbageCollector<UnitObject>>, Vec<Arc<UnitObject>>) {
    let gc = Arc::new(GarbageCollector::new(limit));
    let objects: Vec<_> = (0..4).map(|i| UnitObject::create(&gc, i, i + 1)).collect();
    for obj in &objects {
        gc.enqueue(obj.clone());
    }
    (gc, objects)
}

#[test]
fn test_scenario_budget_forces_one_eviction() {
    let (gc, objects) = four_objects(10);
    assert_eq!(gc.memory_usage(), 4);

    // 预算内：什么都不做
    let report = gc.run_gc().unwrap();
    assert_eq!(report.evicted, 0);

    gc.set_limit(3);
    let report = gc.run_gc().unwrap();
    assert_eq!(report.evicted, 1);
    assert_eq!(gc.memory_usage(), 3);

    assert!(objects[0].is_released());
    assert!(objects[1..].iter().all(|o| !o.is_released()));
    gc.assert_sequence(&[1, 2, 3]);
}

#[test]
fn test_scenario_zero_budget_evicts_all() {
    let (gc, objects) = four_objects(0);

    let report = gc.run_gc().unwrap();
    assert_eq!(report.evicted, 4);
    assert_eq!(report.usage, 0);
    assert_eq!(gc.memory_usage(), 0);
    assert!(gc.is_empty());
    assert!(objects.iter().all(|o| o.is_released()));
}

#[test]
fn test_evicts_least_recently_accessed_first() {
    let gc = Arc::new(GarbageCollector::new(10));
    // 入队顺序 A B C D，访问时间 40 10 30 20
    let a = UnitObject::create(&gc, 0, 40);
    let b = UnitObject::create(&gc, 1, 10);
    let c = UnitObject::create(&gc, 2, 30);
    let d = UnitObject::create(&gc, 3, 20);
    for obj in [&a, &b, &c, &d] {
        gc.enqueue((*obj).clone());
    }
    gc.assert_sequence(&[1, 3, 2, 0]);

    // B 被访问后重新入队：移到末尾，不重复
    b.access.store(50, Ordering::SeqCst);
    gc.enqueue(b.clone());
    assert_eq!(gc.len(), 4);
    gc.assert_sequence(&[3, 2, 0, 1]);

    gc.set_limit(3);
    gc.run_gc().unwrap();
    assert!(d.is_released());
    assert!(!b.is_released());
}

#[test]
fn test_enqueue_dequeue_idempotent() {
    let (gc, objects) = four_objects(10);
    let before = gc.eviction_order();

    // 相同状态重复入队
    gc.enqueue(objects[2].clone());
    assert_eq!(gc.eviction_order(), before);

    // 不在队列中的对象出队
    gc.dequeue(&objects[1]);
    let after_first = gc.eviction_order();
    gc.dequeue(&objects[1]);
    assert_eq!(gc.eviction_order(), after_first);
    assert_eq!(after_first, vec![0, 2, 3]);
    assert!(!gc.contains(&objects[1]));
}

#[test]
fn test_ties_broken_by_insertion_order() {
    let gc = Arc::new(GarbageCollector::new(10));
    let objects: Vec<_> = (0..5).map(|i| UnitObject::create(&gc, i, 7)).collect();
    for obj in objects.iter().rev() {
        gc.enqueue(obj.clone());
    }
    gc.assert_sequence(&[4, 3, 2, 1, 0]);
}

proptest! {
    #[test]
    fn prop_eviction_order_is_stable_sort_by_access(accesses in prop::collection::vec(0u64..16, 1..40)) {
        let gc = Arc::new(GarbageCollector::new(u64::MAX));
        let objects: Vec<_> = accesses
            .iter()
            .enumerate()
            .map(|(i, &access)| UnitObject::create(&gc, i as u64, access))
            .collect();
        for obj in &objects {
            gc.enqueue(obj.clone());
        }

        let mut expected: Vec<(u64, u64)> = accesses
            .iter()
            .enumerate()
            .map(|(i, &access)| (access, i as u64))
            .collect();
        expected.sort_by_key(|&(access, _)| access);
        let expected_ids: Vec<u64> = expected.into_iter().map(|(_, id)| id).collect();

        prop_assert_eq!(gc.eviction_order(), expected_ids);
    }

    #[test]
    fn prop_run_gc_reaches_budget(count in 1usize..30, limit in 0u64..30) {
        let gc = Arc::new(GarbageCollector::new(u64::MAX));
        let objects: Vec<_> = (0..count)
            .map(|i| UnitObject::create(&gc, i as u64, i as u64))
            .collect();
        for obj in &objects {
            gc.enqueue(obj.clone());
        }

        gc.set_limit(limit);
        let report = gc.run_gc().unwrap();
        let expected = count.saturating_sub(limit as usize);
        prop_assert_eq!(report.evicted, expected);
        prop_assert_eq!(gc.memory_usage(), (count - expected) as i64);

        // 被驱逐的正是最旧的那些
        for (i, obj) in objects.iter().enumerate() {
            prop_assert_eq!(obj.is_released(), i < expected);
        }
    }
}
